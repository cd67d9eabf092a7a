// ==========================================
// 匹配建议 / 关联 / 分类 测试
// ==========================================


use budget_reconciler::models::{
    BatchErrorKind, ClassificationSource, ConfidenceTier, IntegrationStatus, LinkRequest, ValidationStatus,
};
use budget_reconciler::{ReconcileError, ReconcileStore};

use test_helpers::{seed_contract, seed_invoice, service, TestService};

async fn construction_site(service: &TestService) {
    seed_contract(
        service,
        1,
        &[
            (1, "Estrutura - Vergalhão", "material", "10000"),
            (2, "Cimento CP2", "material", "1000"),
            (3, "Instalações elétricas", "service", "6000"),
        ],
    )
    .await;
    seed_contract(service, 2, &[(20, "Cimento CP2", "material", "1000")]).await;
}

fn req(line_item_id: i64, budget_item_id: i64) -> LinkRequest {
    LinkRequest { line_item_id, budget_item_id }
}

#[tokio::test]
async fn test_rebar_line_gets_structure_suggestion() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(
        &service,
        10,
        Some(1),
        ValidationStatus::Processed,
        &[(101, "Vergalhão 12mm 500kg", Some("material"), "9500")],
    )
    .await;

    let suggestions = service.generate_linking_suggestions(10, 1, false).await.unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].budget_item_id, 1);
    assert_eq!(suggestions[0].confidence_score, 65);
    assert_eq!(suggestions[0].tier, ConfidenceTier::Low);
    assert_eq!(suggestions[0].factors.value, 95);

    let again = service.generate_linking_suggestions(10, 1, false).await.unwrap();
    assert_eq!(suggestions, again);

    // 低置信度建议不能自动应用
    let err = service.apply_suggestion(101, 1).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
}

#[tokio::test]
async fn test_unlinked_only_skips_budget_items_in_use() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(
        &service,
        11,
        Some(1),
        ValidationStatus::Processed,
        &[(111, "Cimento CP2", Some("material"), "1000"), (112, "Cimento CP2", Some("material"), "1000")],
    )
    .await;

    let all = service.generate_linking_suggestions(11, 1, false).await.unwrap();
    let ids: Vec<(i64, i64)> = all.iter().map(|s| (s.line_item_id, s.budget_item_id)).collect();
    assert_eq!(ids, vec![(111, 2), (112, 2)]);

    service.manual_link(111, Some(2)).await.unwrap();
    let unlinked = service.generate_linking_suggestions(11, 1, true).await.unwrap();
    assert!(unlinked.is_empty());

    let err = service.generate_linking_suggestions(11, 2, false).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
}

#[tokio::test]
async fn test_relinking_keeps_a_single_active_link() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(&service, 12, Some(1), ValidationStatus::Processed, &[(121, "Cimento CP2", None, "1000")]).await;

    service.manual_link(121, Some(1)).await.unwrap();
    let latest = service.manual_link(121, Some(2)).await.unwrap().unwrap();
    assert_eq!(latest.budget_item_id, 2);
    assert!(latest.is_manual);

    let history = service.link_history(121).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|l| l.is_active()).count(), 1);
    assert_eq!(history[0].budget_item_id, 1);
    assert!(history[0].cleared_at.is_some());
    assert_eq!(history[1].id, latest.id);

    let line = service.store().get_line_item(121).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, Some(2));
    assert_eq!(line.integration_status, IntegrationStatus::Integrated);
    assert_eq!(line.classification_source, ClassificationSource::Manual);
    assert_eq!(line.classification_confidence, Some(100));

    // 清除
    assert!(service.manual_link(121, None).await.unwrap().is_none());
    let line = service.store().get_line_item(121).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, None);
    assert_eq!(line.integration_status, IntegrationStatus::Unclassified);
    assert!(service.link_history(121).await.unwrap().iter().all(|l| !l.is_active()));
}

#[tokio::test]
async fn test_apply_high_confidence_suggestion() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(&service, 13, Some(1), ValidationStatus::Processed, &[(131, "Cimento CP2", Some("material"), "1000")]).await;

    let link = service.apply_suggestion(131, 2).await.unwrap();
    assert_eq!(link.confidence, 100);
    assert!(!link.is_manual);

    let line = service.store().get_line_item(131).await.unwrap().unwrap();
    assert_eq!(line.classification_source, ClassificationSource::Heuristic);
    assert_eq!(line.classification_confidence, Some(100));
    assert_eq!(line.category.as_deref(), Some("material"));
}

#[tokio::test]
async fn test_cross_contract_link_is_conflict() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(&service, 14, Some(1), ValidationStatus::Processed, &[(141, "Cimento CP2", Some("material"), "1000")]).await;
    seed_invoice(&service, 15, None, ValidationStatus::Processed, &[(151, "Cimento CP2", Some("material"), "1000")]).await;

    let err = service.manual_link(141, Some(20)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    let err = service.manual_link(151, Some(2)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    let err = service.manual_link(141, Some(404)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound { .. }));

    // 关联合同后即可关联
    service.associate_contract(15, 1).await.unwrap();
    assert!(service.manual_link(151, Some(2)).await.is_ok());
    let err = service.associate_contract(15, 2).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
}

#[tokio::test]
async fn test_batch_commits_valid_items_and_reports_the_rest() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(
        &service,
        16,
        Some(1),
        ValidationStatus::Processed,
        &[
            (161, "Cimento CP2", Some("material"), "1000"),
            (162, "Areia média", None, "500"),
            (163, "Cabo flexível", None, "700"),
            (164, "Brita", None, "300"),
        ],
    )
    .await;

    let result = service
        .apply_batch(
            16,
            1,
            &[
                req(161, 2),
                req(162, 2),   // 低置信度, 仍然接受
                req(161, 3),   // 批内重复
                req(163, 404), // 预算项不存在
                req(164, 20),  // 其他合同的预算项
                req(999, 1),   // 不在该发票上
            ],
        )
        .await
        .unwrap();

    assert!(!result.success);
    let linked: Vec<(i64, i64)> = result.linked_items.iter().map(|l| (l.line_item_id, l.budget_item_id)).collect();
    assert_eq!(linked, vec![(161, 2), (162, 2)]);

    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].line_item_id, 162);
    assert!(result.warnings[0].confidence < 70);

    let kinds: Vec<(i64, BatchErrorKind)> = result.errors.iter().map(|e| (e.line_item_id, e.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (161, BatchErrorKind::Validation),
            (163, BatchErrorKind::NotFound),
            (164, BatchErrorKind::Conflict),
            (999, BatchErrorKind::NotFound),
        ]
    );

    let line = service.store().get_line_item(163).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, None);
}

#[tokio::test]
async fn test_batch_never_overwrites_a_different_link() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(&service, 17, Some(1), ValidationStatus::Processed, &[(171, "Cimento CP2", Some("material"), "1000")]).await;
    service.manual_link(171, Some(2)).await.unwrap();

    // 相同关联重复提交: 成功且不新增记录
    let same = service.apply_batch(17, 1, &[req(171, 2)]).await.unwrap();
    assert!(same.success);
    assert_eq!(same.linked_items.len(), 1);
    assert_eq!(service.link_history(171).await.unwrap().len(), 1);

    let other = service.apply_batch(17, 1, &[req(171, 1)]).await.unwrap();
    assert!(!other.success);
    assert_eq!(other.errors[0].kind, BatchErrorKind::Conflict);
    let line = service.store().get_line_item(171).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, Some(2));

    // 发票级前置条件失败时整体报错
    let err = service.apply_batch(17, 2, &[req(171, 20)]).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
}

#[tokio::test]
async fn test_auto_classification() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(
        &service,
        18,
        Some(1),
        ValidationStatus::Processed,
        &[
            (181, "Cimento CP2", Some("material"), "1000"),
            (182, "Vergalhão 12mm 500kg", Some("material"), "9500"),
            (183, "Almoço equipe", None, "80"),
        ],
    )
    .await;

    // 高置信度: 直接关联
    let high = service.classify_line_item(181).await.unwrap();
    assert!(high.classified);
    assert_eq!(high.link.as_ref().map(|l| l.budget_item_id), Some(2));
    assert_eq!(high.line_item.integration_status, IntegrationStatus::Integrated);

    // 低置信度: 只分类
    let low = service.classify_line_item(182).await.unwrap();
    assert!(low.classified);
    assert!(low.link.is_none());
    assert_eq!(low.line_item.integration_status, IntegrationStatus::Classified);
    assert_eq!(low.line_item.classification_confidence, Some(65));
    assert_eq!(low.line_item.classification_source, ClassificationSource::Heuristic);

    // 无候选: 不变
    let none = service.classify_line_item(183).await.unwrap();
    assert!(!none.classified);
    assert_eq!(none.line_item.integration_status, IntegrationStatus::Unclassified);

    let manual = service.classify_line_item_manual(183, "alimentação").await.unwrap();
    assert_eq!(manual.category.as_deref(), Some("alimentação"));
    assert_eq!(manual.classification_confidence, Some(100));
    assert_eq!(manual.integration_status, IntegrationStatus::Classified);

    let err = service.classify_line_item_manual(183, "  ").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
}

#[tokio::test]
async fn test_auto_classification_keeps_manual_link_metadata() {
    let service = service();
    construction_site(&service).await;
    seed_invoice(
        &service,
        19,
        Some(1),
        ValidationStatus::Processed,
        &[(191, "Vergalhão 12mm 500kg", Some("material"), "9500")],
    )
    .await;

    service.manual_link(191, Some(2)).await.unwrap();
    let outcome = service.classify_line_item(191).await.unwrap();
    assert!(!outcome.classified);
    assert!(outcome.suggestion.is_none());
    assert!(outcome.link.is_none());

    let line = service.store().get_line_item(191).await.unwrap().unwrap();
    assert_eq!(line.linked_budget_item_id, Some(2));
    assert_eq!(line.classification_source, ClassificationSource::Manual);
    assert_eq!(line.classification_confidence, Some(100));
    assert_eq!(line.integration_status, IntegrationStatus::Integrated);
    assert_eq!(service.link_history(191).await.unwrap().len(), 1);
}
