pub mod config;
pub mod error;
pub mod tenant;
pub mod db;
pub mod graph;
pub mod embeddings;
pub mod cache;
pub mod search;
pub mod novelty;
pub mod update;
pub mod dispatch;
pub mod service;

pub use config::Config;
pub use error::{FactgraphError, Result};
pub use tenant::TenantId;
pub use graph::{GraphEdge, GraphNode, GraphStore, Triple};
pub use search::{RetrievalEngine, VectorIndex};
pub use dispatch::{TaskDispatcher, WorkerPool};
pub use service::KnowledgeService;
