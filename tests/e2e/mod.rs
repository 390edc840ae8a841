//! 端到端测试模块
//!
//! 测试完整的准入流程和场景

mod flood_to_block;
mod global_block;
