pub mod server;

pub use server::{Allocation, BuildConfig, ServerHooks, ServerStatus};
