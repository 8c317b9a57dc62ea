pub mod backend;
pub mod chunker;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod filter;
pub mod http_client;
pub mod llm_client;
pub mod report;
pub mod runtime;

#[cfg(test)]
mod test_support;
