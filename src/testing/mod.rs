//! 测试基础设施
//!
//! 在不访问任何真实网络的情况下测试依赖 [`ConversationStore`] 的组件。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockStore`] | 可脚本化的远端存储替身：按序注入失败、统计调用 |
//!
//! # 设计原则
//!
//! - **零网络请求**：内部委托给 [`InMemoryStore`]，完全在内存中运行
//! - **可脚本化**：通过 `with_failure()` / `fail_always()` 精确控制失败序列
//! - **可观测**：通过 `call_count()` / `calls()` 检查每次调用
//!
//! [`ConversationStore`]: crate::store::ConversationStore

mod mock_store;

pub use mock_store::MockStore;
