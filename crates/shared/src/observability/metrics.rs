//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// 初始化 Prometheus 指标导出
///
/// 安装全局 recorder 并在指定端口启动导出器自带的 HTTP 监听。
pub fn init(service_name: &str, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics exporter listening on {}", addr);

    register_common_metrics(service_name);
    Ok(())
}

/// 注册通用指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "ruler_knowledge_base_cache_hits_total",
        "Knowledge base lookups served from cache"
    );
    metrics::describe_counter!(
        "ruler_knowledge_base_loads_total",
        "Knowledge base reloads by outcome"
    );
    metrics::describe_counter!(
        "ruler_version_lookups_total",
        "Latest-version registry lookups by outcome"
    );
    metrics::describe_counter!(
        "ruler_remote_resolutions_total",
        "Remote parameter resolutions by outcome"
    );
    metrics::describe_counter!("ruler_evaluations_total", "Evaluations by outcome");
    metrics::describe_histogram!(
        "ruler_evaluation_duration_seconds",
        "Evaluation duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录知识库缓存命中
#[inline]
pub fn record_cache_hit(knowledge_base: &str) {
    metrics::counter!(
        "ruler_knowledge_base_cache_hits_total",
        "knowledge_base" => knowledge_base.to_string()
    )
    .increment(1);
}

/// 记录知识库重新加载
#[inline]
pub fn record_knowledge_base_load(knowledge_base: &str, status: &str) {
    metrics::counter!(
        "ruler_knowledge_base_loads_total",
        "knowledge_base" => knowledge_base.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录 latest 版本查询
#[inline]
pub fn record_version_lookup(status: &str) {
    metrics::counter!("ruler_version_lookups_total", "status" => status.to_string()).increment(1);
}

/// 记录远程参数解析
#[inline]
pub fn record_remote_resolution(resolver: &str, status: &str) {
    metrics::counter!(
        "ruler_remote_resolutions_total",
        "resolver" => resolver.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录一次评估
#[inline]
pub fn record_evaluation(status: &str, duration_secs: f64) {
    metrics::counter!("ruler_evaluations_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("ruler_evaluation_duration_seconds").record(duration_secs);
}
