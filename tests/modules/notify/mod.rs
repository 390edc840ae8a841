//! 通知模块测试
