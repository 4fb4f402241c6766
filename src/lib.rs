//! 地籍号批量查询服务：任务排队、主数据请求、门户补全、地图截图和报告生成

pub mod app;
pub mod browser;
pub mod core;
pub mod db;
pub mod scrape;
pub mod services;
pub mod utils;
pub mod workflow;
