//! 工具注册表与发现
//!
//! 会话开始时并发查询每个工具服务器的描述列表；单个服务器不可达时跳过其工具、继续，并在 DiscoveryReport 中报告降级。
//! 同名工具按来源加前缀（`origin__name`），只在冲突时才加，保证模型看到的名字尽量短。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use crate::tools::server::{RemoteTool, ServerError, ToolServer};
use crate::tools::{EffectClass, ToolDescriptor, ToolFamily};

/// 来源分隔符
pub const NAMESPACE_SEPARATOR: &str = "__";

/// 发现失败的服务器
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedServer {
    pub server: String,
    pub reason: String,
}

/// 一次发现的结果摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub tool_count: usize,
    pub degraded: Vec<DegradedServer>,
}

impl DiscoveryReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// 工具注册表：暴露名 → 描述 + 所属服务器
pub struct ToolRegistry {
    servers: Vec<Arc<dyn ToolServer>>,
    descriptors: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
    excluded: HashSet<String>,
    discovery_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(servers: Vec<Arc<dyn ToolServer>>, discovery_timeout: Duration) -> Self {
        Self {
            servers,
            descriptors: Vec::new(),
            index: HashMap::new(),
            excluded: HashSet::new(),
            discovery_timeout,
        }
    }

    pub fn with_excluded(mut self, excluded: impl IntoIterator<Item = String>) -> Self {
        self.excluded = excluded.into_iter().collect();
        self
    }

    /// 构建并完成首次发现
    pub async fn discover(
        servers: Vec<Arc<dyn ToolServer>>,
        discovery_timeout: Duration,
        excluded: Vec<String>,
    ) -> (Self, DiscoveryReport) {
        let mut registry = Self::new(servers, discovery_timeout).with_excluded(excluded);
        let report = registry.refresh().await;
        (registry, report)
    }

    /// 重新查询所有服务器；整体替换描述表
    pub async fn refresh(&mut self) -> DiscoveryReport {
        let limit = self.discovery_timeout;
        let listings = join_all(self.servers.iter().map(|server| {
            let server = server.clone();
            async move {
                let listed = match tokio::time::timeout(limit, server.list_tools()).await {
                    Ok(res) => res,
                    Err(_) => Err(ServerError::Unreachable(format!(
                        "discovery timed out after {}ms",
                        limit.as_millis()
                    ))),
                };
                (server.name().to_string(), listed)
            }
        }))
        .await;

        let mut report = DiscoveryReport::default();
        let mut collected: Vec<(String, RemoteTool)> = Vec::new();
        for (origin, listed) in listings {
            match listed {
                Ok(tools) => {
                    tracing::info!(server = %origin, count = tools.len(), "tool server discovered");
                    collected.extend(tools.into_iter().map(|t| (origin.clone(), t)));
                }
                Err(e) => {
                    tracing::warn!(server = %origin, error = %e, "tool server unavailable, skipping");
                    report.degraded.push(DegradedServer {
                        server: origin,
                        reason: e.to_string(),
                    });
                }
            }
        }

        collected.retain(|(origin, t)| {
            let qualified = format!("{origin}{NAMESPACE_SEPARATOR}{}", t.name);
            !(self.excluded.contains(&t.name) || self.excluded.contains(&qualified))
        });

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, t) in &collected {
            *counts.entry(t.name.as_str()).or_default() += 1;
        }

        let descriptors: Vec<ToolDescriptor> = collected
            .iter()
            .map(|(origin, t)| {
                let name = if counts.get(t.name.as_str()).copied().unwrap_or(0) > 1 {
                    format!("{origin}{NAMESPACE_SEPARATOR}{}", t.name)
                } else {
                    t.name.clone()
                };
                ToolDescriptor {
                    name,
                    remote_name: t.name.clone(),
                    origin: origin.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                    effect: t.effect.unwrap_or_else(|| EffectClass::infer(&t.name)),
                    family: ToolFamily::infer(&t.name, &t.description),
                }
            })
            .collect();

        self.index = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        self.descriptors = descriptors;
        report.tool_count = self.descriptors.len();
        report
    }

    /// 按暴露名查找；也接受唯一的原名或带前缀的全名
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        if let Some(&i) = self.index.get(name) {
            return self.descriptors.get(i);
        }
        if let Some((origin, remote)) = name.split_once(NAMESPACE_SEPARATOR) {
            if let Some(d) = self
                .descriptors
                .iter()
                .find(|d| d.origin == origin && d.remote_name == remote)
            {
                return Some(d);
            }
        }
        let mut by_remote = self.descriptors.iter().filter(|d| d.remote_name == name);
        match (by_remote.next(), by_remote.next()) {
            (Some(d), None) => Some(d),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 所属服务器（调用句柄）
    pub fn server_for(&self, descriptor: &ToolDescriptor) -> Option<Arc<dyn ToolServer>> {
        self.servers
            .iter()
            .find(|s| s.name() == descriptor.origin)
            .cloned()
    }

    /// 全部描述，顺序确定（服务器配置顺序 + 服务器返回顺序）
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    /// 按类别收窄；结果为空时退回全部工具
    pub fn descriptors_for(&self, families: &[ToolFamily]) -> Vec<ToolDescriptor> {
        if families.is_empty() {
            return self.descriptors.clone();
        }
        let scoped: Vec<ToolDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| families.contains(&d.family))
            .cloned()
            .collect();
        if scoped.is_empty() {
            self.descriptors.clone()
        } else {
            scoped
        }
    }

    pub fn discovery_tools(&self) -> Vec<&ToolDescriptor> {
        self.descriptors.iter().filter(|d| d.is_discovery()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
