//! Virtual filesystem core for studip-fuse: template compilation, the
//! lazily-materialized node tree, the bounded REST crawler, and the
//! content-addressed disk cache. The `fuse` binary is the only consumer of
//! this crate's public surface; everything here is transport-agnostic.

pub mod cache;
pub mod config;
pub mod crawler;
pub mod entity;
pub mod error;
pub mod resolver;
pub mod status;
pub mod template;
pub mod token;

pub use cache::{ContentCache, ContentStatus};
pub use config::{AuthProvider, ConfigError, ConfigFile, MountConfig, StaticToken};
pub use crawler::{Crawler, Endpoints, HttpRemoteSource, RemoteSource};
pub use entity::{Course, Entity, File, Folder, Level, Semester};
pub use error::{AuthError, CacheError, CrawlError, NodeExpansionError, TemplateError};
pub use resolver::{MaterializationState, NodeId, Resolver, VirtualNode};
pub use status::{StatusLevel, StatusReporter};
pub use template::{Fragment, Segment, Template};
pub use token::{Bindings, Token};
