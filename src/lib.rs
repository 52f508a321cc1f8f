// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

pub mod asset;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod container;
pub mod exception;
pub mod param;
pub mod request;
pub mod response;
pub mod server;
pub mod util;

pub use asset::{load_container, load_container_file, Asset, AssetProvider, AssetStore, LoadOutcome};
pub use cache::{CacheBuilder, ResponseCache};
pub use config::{AppManifest, Config};
pub use container::{read_container, write_container, AssetRecord, ContainerContents};
pub use exception::Exception;
pub use request::RequestTarget;
pub use response::CachedResponse;
pub use server::{Server, ServerHandle, ServerStats};
