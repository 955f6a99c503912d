//! 评估服务集成测试
//!
//! 测试从知识库获取、规则执行、远程参数解析到结果合并的完整流程。

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{MemoryLoader, ScriptEngine, StaticResolver, shared};
use mockito::Matcher;
use ruler::{
    BridgeResolver, KnowledgeBaseCache, KnowledgeBaseState, RulerError, RulerService, TypedMap,
    Value,
};
use ruler_shared::config::{AppConfig, ResourceLoaderKind};
use serde_json::json;

fn service_with(loader: Arc<MemoryLoader>) -> RulerService<ScriptEngine> {
    let cache = KnowledgeBaseCache::new(shared(ScriptEngine), loader, Duration::from_secs(60));
    RulerService::new(Arc::new(cache))
}

fn params(pairs: &[(&str, Value)]) -> TypedMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_missing_required_param_keeps_features() {
    let loader = shared(MemoryLoader::new());
    loader.insert(
        "credit",
        "3",
        "require age,income\nadult is_adult age\nset channel mobile",
    );
    let service = service_with(loader);

    let ctx = service.new_context(params(&[("age", Value::from("21"))]));
    let outcome = service.evaluate("credit", "3", ctx).await.unwrap();

    assert_eq!(outcome.status_code(), 400);
    assert_eq!(outcome.required_param_errors.len(), 1);
    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        json!({
            "is_adult": "true",
            "channel": "mobile",
            "requiredParamErrors": {"income": "parameter income is required"}
        })
    );
}

#[tokio::test]
async fn test_remote_param_resolved_once_per_evaluation() {
    let loader = shared(MemoryLoader::new());
    loader.insert(
        "offers",
        "1",
        "remote segment customer\ncopy first segment\ncopy second segment",
    );
    let resolver = shared(StaticResolver::new(&[("segment", Value::from("gold"))]));
    let service = service_with(loader).with_resolver(resolver.clone());

    let outcome = service
        .evaluate("offers", "1", service.new_context(TypedMap::new()))
        .await
        .unwrap();

    assert_eq!(resolver.calls(), 1);
    assert_eq!(outcome.features.get_string("first"), "gold");
    assert_eq!(outcome.features.get_string("second"), "gold");
    assert!(!outcome.is_partial());
}

#[tokio::test]
async fn test_unresolvable_required_param_reported_once() {
    let loader = shared(MemoryLoader::new());
    loader.insert(
        "offers",
        "1",
        "remote score bureau\nrequire score\ncopy score score\nset tier silver",
    );
    let resolver = shared(StaticResolver::new(&[]));
    let service = service_with(loader).with_resolver(resolver.clone());

    let outcome = service
        .evaluate("offers", "1", service.new_context(TypedMap::new()))
        .await
        .unwrap();

    assert_eq!(resolver.calls(), 1);
    assert_eq!(outcome.features.get_string("tier"), "silver");
    assert_eq!(
        outcome.required_param_errors.get("score").map(String::as_str),
        Some("parameter score is required")
    );
    assert_eq!(
        outcome.errors["score"],
        vec!["score: no data for parameter".to_string()]
    );
}

#[tokio::test]
async fn test_bridge_resolution_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let bridge_mock = server
        .mock("POST", "/resolve/payroll")
        .match_body(Matcher::PartialJson(json!({"load": ["cpf"]})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"context": {"cpf": 8250.75}}"#)
        .expect(1)
        .create_async()
        .await;

    let loader = shared(MemoryLoader::new());
    loader.insert("salary", "2", "remote income payroll cpf\ncopy income income");
    let bridge = BridgeResolver::new(server.url(), &HashMap::new(), Duration::from_secs(5)).unwrap();
    let service = service_with(loader).with_resolver(shared(bridge));

    let ctx = service.context_from_json(r#"{"cpf": "123.456.789-00"}"#).unwrap();
    let outcome = service.evaluate("salary", "2", ctx).await.unwrap();

    bridge_mock.assert_async().await;
    assert_eq!(outcome.features.get_float("income"), Ok(8250.75));
}

#[tokio::test]
async fn test_unreachable_bridge_is_partial_failure() {
    let loader = shared(MemoryLoader::new());
    loader.insert("salary", "2", "remote income payroll\ncopy income income\nset ok yes");
    let bridge =
        BridgeResolver::new("http://127.0.0.1:1", &HashMap::new(), Duration::from_secs(1)).unwrap();
    let service = service_with(loader).with_resolver(shared(bridge));

    let outcome = service
        .evaluate("salary", "2", service.new_context(TypedMap::new()))
        .await
        .unwrap();

    assert_eq!(outcome.status_code(), 200);
    assert_eq!(outcome.features.get_string("ok"), "yes");
    assert!(outcome.errors["income"][0].contains("payroll"));
}

#[tokio::test]
async fn test_engine_panic_becomes_evaluation_fault() {
    let loader = shared(MemoryLoader::new());
    loader.insert("kb", "1", "set a 1\npanic");
    let service = service_with(loader);

    let err = service
        .evaluate("kb", "1", service.new_context(TypedMap::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, RulerError::EvaluationFault(_)));
    assert_eq!(err.status_code(), 500);
    // 故障后租约已释放，知识库仍可使用
    assert_eq!(service.cache().state("kb", "1"), KnowledgeBaseState::Ready);
}

#[tokio::test]
async fn test_unknown_knowledge_base_aborts_request() {
    let service = service_with(shared(MemoryLoader::new()));
    let err = service
        .evaluate("ghost", "4", service.new_context(TypedMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_empty_name_uses_defaults() {
    let loader = shared(MemoryLoader::new());
    loader.insert("default", "5", "set source default");
    let service = service_with(loader).with_defaults("default", "5");

    let outcome = service
        .evaluate("", "", service.new_context(TypedMap::new()))
        .await
        .unwrap();

    assert_eq!(outcome.knowledge_base.name, "default");
    assert_eq!(outcome.features.get_string("source"), "default");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_releases_lease() {
    let loader = shared(MemoryLoader::new());
    loader.insert("slow", "1", "sleep 5000\nset done true");
    let service = service_with(loader);

    let err = service
        .evaluate_with_deadline(
            "slow",
            "1",
            service.new_context(TypedMap::new()),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RulerError::DeadlineExceeded));
    assert_eq!(err.status_code(), 504);
    assert_eq!(service.cache().state("slow", "1"), KnowledgeBaseState::Ready);
}

#[tokio::test]
async fn test_context_from_json_rejects_non_object() {
    let service = service_with(shared(MemoryLoader::new()));
    let err = service.context_from_json("[1, 2, 3]").unwrap_err();
    assert_eq!(err.code(), "JSON_ERROR");
}

#[tokio::test]
async fn test_service_from_file_config() {
    let rules = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(rules.path().join("promo")).unwrap();
    std::fs::write(rules.path().join("promo/1.grl"), "set discount 10").unwrap();

    let mut config = AppConfig::default();
    config.service_name = "feature-ruler".to_string();
    config.resource_loader.kind = ResourceLoaderKind::File;
    config.resource_loader.file.path_template =
        format!("{}/{{knowledgeBase}}/{{version}}.grl", rules.path().display());

    let service = RulerService::from_config(shared(ScriptEngine), &config, None).unwrap();
    let outcome = service
        .evaluate("promo", "1", service.new_context(TypedMap::new()))
        .await
        .unwrap();

    assert_eq!(outcome.features.get_int("discount"), Ok(10));

    // 文件加载方式没有版本仓库
    let err = service
        .evaluate("promo", "", service.new_context(TypedMap::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LOAD_FAILED");
}
