pub mod defer;
pub mod http;
