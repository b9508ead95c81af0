//! 帧层测试
//!
//! 所有用例共享 `fixtures` 中手工搭建的调用链。
