//! HTTP clients for the job provider and the downstream consumer.

pub mod openai;
pub mod webhook;

pub use openai::OpenAiBatchClient;
pub use webhook::HttpCallbackSink;

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
