//! Kriya - 自主维护守护进程
//!
//! 模块划分：
//! - **core**: 阶段引擎（单写者迭代循环）、状态快照、存活监测、关闭协调
//! - **agent**: 各阶段的具体工作（感知、推理、执行、记忆、遥测、修补）
//! - **llm**: 混合推理路由（本地 / 云端候选回退链）
//! - **hardware**: CPU / 内存 / 显存 / 磁盘采样
//! - **sandbox**: Docker 沙箱执行
//! - **memory**: SQLite 执行记录与相似度召回
//! - **cloud**: 遥测上报与技能检索
//! - **btrfs**: 破坏性动作前的系统快照
//! - **ipc**: unix socket 观察 / 命令接口
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod agent;
pub mod btrfs;
pub mod cloud;
pub mod config;
pub mod core;
pub mod hardware;
#[cfg(feature = "ipc")]
pub mod ipc;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod sandbox;

pub use crate::core::{EngineBuilder, PhaseEngine, StateReader, StateSnapshot};
