pub mod manifest_utils;
pub mod proxy_url_utils;
