//! 递归解析流水线
//!
//! 每个条目按声明顺序依次经过处理器。处理器可以放行（可能已修改的）条目，
//! 也可以声明已消费该条目，同时通过 [`PipelineContext::execute`] 派生新条目，
//! 新条目从第一个处理器重新开始。派生条目放入显式的工作集中并发推进，
//! 全部分支结束后 [`Pipeline::execute`] 才返回。单个分支的失败不影响其他分支。

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use pacs_core::{PacsError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// 默认最大派生深度
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// 处理器的处理结果
#[derive(Debug)]
pub enum Flow<I, O> {
    /// 交给下一个处理器
    Next(I),
    /// 条目已被消费，可能附带一个终端结果
    Done(Option<O>),
}

/// 处理器上下文
#[derive(Debug)]
pub struct PipelineContext<I> {
    depth: usize,
    spawned: Vec<I>,
}

impl<I> PipelineContext<I> {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            spawned: Vec::new(),
        }
    }

    /// 派生新条目，其结果计入本次执行的结果集
    pub fn execute(&mut self, item: I) {
        self.spawned.push(item);
    }

    /// 条目已被完全消费，不产生终端结果
    pub fn done<O>(&self) -> Flow<I, O> {
        Flow::Done(None)
    }

    /// 条目作为终端结果被消费
    pub fn done_with<O>(&self, result: O) -> Flow<I, O> {
        Flow::Done(Some(result))
    }

    /// 当前条目的派生深度，顶层条目为0
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// 流水线处理器
#[async_trait]
pub trait Handler<I: Send, O: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, item: I, ctx: &mut PipelineContext<I>) -> Result<Flow<I, O>>;
}

/// 一次执行的全部终端结果与分支错误
#[derive(Debug)]
pub struct PipelineOutcome<O> {
    pub results: Vec<O>,
    pub errors: Vec<PacsError>,
}

impl<O> Default for PipelineOutcome<O> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<O> PipelineOutcome<O> {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

type Handlers<I, O> = Arc<Vec<Arc<dyn Handler<I, O>>>>;

struct Step<I, O> {
    depth: usize,
    result: Result<Option<O>>,
    spawned: Vec<I>,
}

/// 递归解析流水线
pub struct Pipeline<I, O> {
    handlers: Handlers<I, O>,
    max_depth: usize,
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(handlers: Vec<Arc<dyn Handler<I, O>>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// 执行单个顶层条目，等待全部派生分支结束
    pub async fn execute(&self, item: I) -> PipelineOutcome<O> {
        let mut outcome = PipelineOutcome::default();
        let mut in_flight = FuturesUnordered::new();
        in_flight.push(run_item(self.handlers.clone(), item, 0));

        while let Some(step) = in_flight.next().await {
            match step.result {
                Ok(Some(result)) => outcome.results.push(result),
                Ok(None) => {}
                Err(e) => {
                    warn!("解析分支失败 (深度 {}): {}", step.depth, e);
                    outcome.errors.push(e);
                }
            }

            let child_depth = step.depth + 1;
            for child in step.spawned {
                if child_depth > self.max_depth {
                    outcome.errors.push(PacsError::Resolution(format!(
                        "超过最大派生深度 {}",
                        self.max_depth
                    )));
                    continue;
                }
                in_flight.push(run_item(self.handlers.clone(), child, child_depth));
            }
        }

        outcome
    }

    /// 并发执行多个顶层条目，结果顺序与输入一致
    pub async fn execute_all(&self, items: Vec<I>) -> Vec<PipelineOutcome<O>> {
        join_all(items.into_iter().map(|item| self.execute(item))).await
    }
}

async fn run_item<I, O>(handlers: Handlers<I, O>, item: I, depth: usize) -> Step<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let mut ctx = PipelineContext::new(depth);
    let mut current = item;

    for handler in handlers.iter() {
        match handler.handle(current, &mut ctx).await {
            Ok(Flow::Next(next)) => current = next,
            Ok(Flow::Done(result)) => {
                debug!("条目由处理器 {} 消费", handler.name());
                return Step {
                    depth,
                    result: Ok(result),
                    spawned: ctx.spawned,
                };
            }
            Err(e) => {
                return Step {
                    depth,
                    result: Err(e),
                    spawned: ctx.spawned,
                };
            }
        }
    }

    Step {
        depth,
        result: Err(PacsError::Resolution("没有处理器消费该条目".to_string())),
        spawned: ctx.spawned,
    }
}
