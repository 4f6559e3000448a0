//! Shared-memory context tests
//!
//! 测试上下文发布、引用计数、回收与零拷贝读取

mod layout;

use crate::runtime::memory::ContextManager;
use crate::util::config::ArenaConfig;

pub(crate) fn manager(slot_count: u32) -> ContextManager {
    ContextManager::create(&ArenaConfig {
        slot_count,
        slot_size: 4096,
        dir: None,
    })
    .unwrap()
}
