// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod buffer;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod managers;
pub mod message;
pub mod server;
pub mod session;
pub mod store;
pub mod stream;
pub mod types;
pub mod workers;
