mod client;
mod dispatcher;
mod pending;

pub use client::KvWorker;
