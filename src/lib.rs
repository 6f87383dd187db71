//! Duet - 语音陪伴助手的工具调用编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话编排、构建、恢复策略、轮次监管
//! - **intent**: 意图路由（关键词规则表 / 小模型分类）
//! - **llm**: 模型后端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 有上限的对话记忆与持久化
//! - **observability**: 日志初始化
//! - **tools**: 工具描述、注册表、校验器、执行器与工具服务器
//! - **turn**: 单轮编排（Broker、续接控制器、叙述、过程事件）

pub mod config;
pub mod core;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod turn;
