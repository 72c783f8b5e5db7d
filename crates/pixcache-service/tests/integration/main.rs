mod http;
mod loader;
mod utils;
