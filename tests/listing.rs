mod common;

use object_gateway::{
    backend::{BackendError, Operation},
    models::list_item::ListItem,
    services::gateway_service::{GatewayError, GatewaySettings},
};

async fn seed(backend: &object_gateway::backend::MemoryBackend) {
    backend.insert_object("a/", "").await;
    backend.insert_object("a/x.txt", "xxx").await;
    backend.insert_object("a/y.txt", "yy").await;
    backend.insert_object("a/b/deep.txt", "d").await;
    backend.insert_object("a/b/deeper/z.txt", "z").await;
    backend.insert_object("other.txt", "o").await;
}

#[tokio::test]
async fn lists_one_level_with_folders_first() {
    let (backend, service) = common::gateway().await;
    seed(&backend).await;

    let result = service.list("a/", None, None).await.unwrap();
    let ids: Vec<&str> = result.items.iter().map(ListItem::id).collect();
    assert_eq!(ids, vec!["a/b/", "a/x.txt", "a/y.txt"]);
    assert!(result.items[0].is_folder());
    assert_eq!(result.items[0].name(), "b");
    assert_eq!(result.items[1].name(), "x.txt");
    assert!(result.next_continuation_token.is_none());

    match &result.items[1] {
        ListItem::File { size, url, .. } => {
            assert_eq!(*size, 3);
            assert_eq!(url, "memory://assets/a/x.txt");
        }
        other => panic!("expected a file, got {:?}", other),
    }
}

#[tokio::test]
async fn root_listing_collapses_top_level_folders() {
    let (backend, service) = common::gateway().await;
    seed(&backend).await;

    let result = service.list("", None, None).await.unwrap();
    let ids: Vec<&str> = result.items.iter().map(ListItem::id).collect();
    assert_eq!(ids, vec!["a/", "other.txt"]);
}

#[tokio::test]
async fn query_filters_by_name_case_insensitively() {
    let (backend, service) = common::gateway().await;
    seed(&backend).await;

    // plain substring match: the `x` of `.txt` matches every text file
    let result = service.list("a/", Some("X"), None).await.unwrap();
    let ids: Vec<&str> = result.items.iter().map(ListItem::id).collect();
    assert_eq!(ids, vec!["a/x.txt", "a/y.txt"]);

    let result = service.list("a/", Some("X."), None).await.unwrap();
    let ids: Vec<&str> = result.items.iter().map(ListItem::id).collect();
    assert_eq!(ids, vec!["a/x.txt"]);

    let result = service.list("a/", Some("B"), None).await.unwrap();
    let ids: Vec<&str> = result.items.iter().map(ListItem::id).collect();
    assert_eq!(ids, vec!["a/b/"]);

    let result = service.list("a/", Some("   "), None).await.unwrap();
    assert_eq!(result.items.len(), 3);
}

#[tokio::test]
async fn pages_follow_continuation_tokens() {
    let (backend, service) = common::gateway_with(GatewaySettings {
        list_page_size: 2,
        ..common::settings()
    })
    .await;
    seed(&backend).await;

    let first = service.list("a/", None, None).await.unwrap();
    let token = first.next_continuation_token.clone().expect("more pages");
    let second = service.list("a/", None, Some(token)).await.unwrap();

    let mut ids: Vec<String> = first
        .items
        .iter()
        .chain(second.items.iter())
        .map(|item| item.id().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a/b/", "a/x.txt", "a/y.txt"]);
    assert!(second.next_continuation_token.is_none());
}

#[tokio::test]
async fn transient_listing_failures_are_retried() {
    let (backend, service) = common::gateway().await;
    seed(&backend).await;
    backend
        .fail_next(
            Operation::ListPage,
            BackendError::unavailable(Operation::ListPage, "503 SlowDown"),
        )
        .await;

    let result = service.list("a/", None, None).await.unwrap();
    assert_eq!(result.items.len(), 3);
    assert_eq!(backend.call_count(Operation::ListPage).await, 2);
}

#[tokio::test]
async fn rejected_listing_is_not_retried() {
    let (backend, service) = common::gateway().await;
    backend
        .fail_next(
            Operation::ListPage,
            BackendError::rejected(Operation::ListPage, "AccessDenied", "denied"),
        )
        .await;

    let err = service.list("a/", None, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::Backend(BackendError::Rejected { .. })));
    assert_eq!(backend.call_count(Operation::ListPage).await, 1);
}

#[tokio::test]
async fn unsafe_prefix_is_refused_before_backend_call() {
    let (backend, service) = common::gateway().await;
    let err = service.list("../etc/", None, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidKey(_)));
    assert_eq!(backend.call_count(Operation::ListPage).await, 0);
}
