//! 知识库检索能力
//!
//! 检索子系统只通过 `Retriever::search(query, k)` 使用；这里提供 InMemoryRetriever（关键词重叠，
//! 无真实向量）以及两个本地能力 retrieve_documents / search_documents。

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::capability::registry::LocalCapability;

/// 检索结果片段
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub source: String,
    pub page: Option<u32>,
    /// 0.0 ~ 1.0，越大越相关
    pub score: f32,
}

/// 检索接口
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Chunk>, String>;
}

fn tokenize_lower(s: &str) -> std::collections::HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

struct Entry {
    content: String,
    source: String,
    page: Option<u32>,
    tokens: std::collections::HashSet<String>,
}

/// 内存检索：按查询词与文档词的重叠比例打分
#[derive(Clone, Default)]
pub struct InMemoryRetriever {
    store: Arc<RwLock<Vec<Entry>>>,
}

impl InMemoryRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source: &str, page: Option<u32>, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Entry {
                tokens: tokenize_lower(content),
                content: content.to_string(),
                source: source.to_string(),
                page,
            });
    }

    /// 载入文本文件：按空行切段，段序号作为页码
    pub fn load_file(&self, path: &Path) -> std::io::Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let source = path.display().to_string();
        let mut count = 0;
        for (i, para) in text.split("\n\n").filter(|p| !p.trim().is_empty()).enumerate() {
            self.add(&source, Some(i as u32 + 1), para);
            count += 1;
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Chunk>, String> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<Chunk> = store
            .iter()
            .filter_map(|entry| {
                let overlap = query_tokens.intersection(&entry.tokens).count();
                (overlap > 0).then(|| Chunk {
                    content: entry.content.clone(),
                    source: entry.source.clone(),
                    page: entry.page,
                    score: overlap as f32 / query_tokens.len() as f32,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| crate::capability::protocol::empty_schema())
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RetrieveArgs {
    /// The search query to find relevant documents
    #[serde(alias = "input")]
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    /// The search query
    #[serde(alias = "input")]
    query: String,
    /// Number of results to return
    #[serde(default)]
    num_results: Option<usize>,
}

/// retrieve_documents：取 default_k 条并带来源与页码
pub struct RetrieveDocuments {
    retriever: Arc<dyn Retriever>,
    k: usize,
}

impl RetrieveDocuments {
    pub fn new(retriever: Arc<dyn Retriever>, k: usize) -> Self {
        Self { retriever, k }
    }
}

#[async_trait]
impl LocalCapability for RetrieveDocuments {
    fn name(&self) -> &str {
        "retrieve_documents"
    }

    fn description(&self) -> &str {
        "Retrieve relevant documents from the knowledge base. Use this when you need \
         information from uploaded documents to answer the user's question."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<RetrieveArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: RetrieveArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {}", e))?;
        tracing::info!(query = %args.query, k = self.k, "knowledge base retrieval");
        let results = self.retriever.search(&args.query, self.k).await?;
        if results.is_empty() {
            return Ok("No relevant documents found in the knowledge base.".to_string());
        }
        Ok(results
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let page = chunk
                    .page
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                format!(
                    "[Document {}] Source: {}, Page: {}\n{}",
                    i + 1,
                    chunk.source,
                    page,
                    chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// search_documents：调用方指定条数，附相关度
pub struct SearchDocuments {
    retriever: Arc<dyn Retriever>,
    default_k: usize,
}

impl SearchDocuments {
    pub fn new(retriever: Arc<dyn Retriever>, default_k: usize) -> Self {
        Self { retriever, default_k }
    }
}

#[async_trait]
impl LocalCapability for SearchDocuments {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Search the knowledge base with a specific query and return excerpts from the most \
         relevant documents together with a relevance score."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SearchArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {}", e))?;
        let k = args.num_results.unwrap_or(self.default_k).max(1);
        tracing::info!(query = %args.query, k, "document search");
        let results = self.retriever.search(&args.query, k).await?;
        if results.is_empty() {
            return Ok("No relevant documents found in the knowledge base.".to_string());
        }
        Ok(results
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "[{}] {} (Relevance: {:.1}%)\n{}",
                    i + 1,
                    chunk.source,
                    chunk.score * 100.0,
                    chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
