mod http_json;
mod static_source;

pub use http_json::HttpJsonAdapter;
pub use static_source::StaticAdapter;
