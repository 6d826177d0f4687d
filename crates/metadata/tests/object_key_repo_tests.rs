//! Object and file key repository tests.

mod common;

use common::*;
use murmur_metadata::{MetadataError, MetadataStore};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_create_object_with_key_is_atomic() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1024, true);
        let key = file_key_row(object.object_id);
        store.create_object(&object, Some(&key)).await.unwrap();

        assert!(store.get_object(object.object_id).await.unwrap().is_some());
        let stored = store.get_file_key(object.object_id).await.unwrap().unwrap();
        assert_eq!(stored.wrapped_key, key.wrapped_key);
        assert_eq!(stored.kek_name, "master");

        // A key row pointing at a missing object violates its foreign key, so
        // the object insert in the same transaction must roll back too.
        let orphan_object = object_row("audio", 10, true);
        let bad_key = file_key_row(Uuid::new_v4());
        let err = store
            .create_object(&orphan_object, Some(&bad_key))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)), "got {err:?}");
        assert!(store.get_object(orphan_object.object_id).await.unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_object_rejected() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, false);
        store.create_object(&object, None).await.unwrap();
        let err = store.create_object(&object, None).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)), "got {err:?}");
    })
    .await;
}

#[tokio::test]
async fn test_unencrypted_object_has_no_key() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 5 * 1024 * 1024, false);
        store.create_object(&object, None).await.unwrap();
        assert!(store.get_file_key(object.object_id).await.unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_share_requires_file_key() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, false);
        store.create_object(&object, None).await.unwrap();
        let err = store
            .create_file_key_share(&share_row(object.object_id, "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)), "got {err:?}");
    })
    .await;
}

#[tokio::test]
async fn test_share_lifecycle() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, true);
        store
            .create_object(&object, Some(&file_key_row(object.object_id)))
            .await
            .unwrap();
        let file_id = object.object_id;

        store.create_file_key_share(&share_row(file_id, "bob")).await.unwrap();
        store.create_file_key_share(&share_row(file_id, "carol")).await.unwrap();

        // Re-sharing replaces the wrapped key.
        let mut replacement = share_row(file_id, "bob");
        replacement.wrapped_key = vec![1u8; 72];
        replacement.kek_version = 2;
        store.create_file_key_share(&replacement).await.unwrap();

        let bob = store.get_file_key_share(file_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.wrapped_key, vec![1u8; 72]);
        assert_eq!(bob.kek_version, 2);

        let shares = store.list_file_key_shares(file_id).await.unwrap();
        let users: Vec<_> = shares.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(users, vec!["bob", "carol"]);

        assert!(store.delete_file_key_share(file_id, "bob").await.unwrap());
        assert!(!store.delete_file_key_share(file_id, "bob").await.unwrap());
        assert!(store.get_file_key_share(file_id, "bob").await.unwrap().is_none());

        assert_eq!(store.delete_all_file_key_shares(file_id).await.unwrap(), 1);
        assert!(store.list_file_key_shares(file_id).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_delete_file_key_removes_shares() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, true);
        let file_id = object.object_id;
        store
            .create_object(&object, Some(&file_key_row(file_id)))
            .await
            .unwrap();
        store.create_file_key_share(&share_row(file_id, "bob")).await.unwrap();

        assert!(store.delete_file_key(file_id).await.unwrap());
        assert!(store.get_file_key(file_id).await.unwrap().is_none());
        assert!(store.list_file_key_shares(file_id).await.unwrap().is_empty());
        assert!(!store.delete_file_key(file_id).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_update_and_rewrap_file_key() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, true);
        let file_id = object.object_id;
        store
            .create_object(&object, Some(&file_key_row(file_id)))
            .await
            .unwrap();
        store.create_file_key_share(&share_row(file_id, "bob")).await.unwrap();

        let mut key = file_key_row(file_id);
        key.wrapped_key = vec![3u8; 72];
        key.kek_version = 2;
        store.update_file_key(&key).await.unwrap();
        assert_eq!(store.get_file_key(file_id).await.unwrap().unwrap().kek_version, 2);

        key.kek_version = 3;
        let mut share = share_row(file_id, "bob");
        share.kek_version = 5;
        assert_eq!(store.rewrap_file_key(&key, &[share]).await.unwrap(), 1);
        assert_eq!(store.get_file_key(file_id).await.unwrap().unwrap().kek_version, 3);
        let bob = store.get_file_key_share(file_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.kek_version, 5);

        let missing = file_key_row(Uuid::new_v4());
        let err = store.update_file_key(&missing).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_rewrap_does_not_restore_revoked_share() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, true);
        let file_id = object.object_id;
        store
            .create_object(&object, Some(&file_key_row(file_id)))
            .await
            .unwrap();
        store.create_file_key_share(&share_row(file_id, "bob")).await.unwrap();
        store.create_file_key_share(&share_row(file_id, "carol")).await.unwrap();

        let mut listed = store.list_file_key_shares(file_id).await.unwrap();
        assert!(store.delete_file_key_share(file_id, "bob").await.unwrap());

        for share in &mut listed {
            share.kek_version = 2;
        }
        let mut key = file_key_row(file_id);
        key.kek_version = 2;
        assert_eq!(store.rewrap_file_key(&key, &listed).await.unwrap(), 1);

        assert!(store.get_file_key_share(file_id, "bob").await.unwrap().is_none());
        let carol = store.get_file_key_share(file_id, "carol").await.unwrap().unwrap();
        assert_eq!(carol.kek_version, 2);
        assert_eq!(store.list_file_key_shares(file_id).await.unwrap().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_delete_object_cascades() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        let object = object_row("audio", 1, true);
        let file_id = object.object_id;
        store
            .create_object(&object, Some(&file_key_row(file_id)))
            .await
            .unwrap();
        store.create_file_key_share(&share_row(file_id, "bob")).await.unwrap();
        let job = job_for_object(file_id);
        store.create_job(&job).await.unwrap();

        assert!(store.delete_object_cascade(file_id).await.unwrap());
        assert!(store.get_object(file_id).await.unwrap().is_none());
        assert!(store.get_file_key(file_id).await.unwrap().is_none());
        assert!(store.get_file_key_share(file_id, "bob").await.unwrap().is_none());
        assert!(store.get_job(job.job_id).await.unwrap().is_none());

        assert!(!store.delete_object_cascade(file_id).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_bucket_size_and_listing() {
    run_metadata_test_both(|store: Arc<dyn MetadataStore>| async move {
        assert_eq!(store.bucket_size("audio").await.unwrap(), 0);

        for size in [100, 250] {
            store.create_object(&object_row("audio", size, false), None).await.unwrap();
        }
        let mut other = object_row("video", 4_000, false);
        other.user_id = "user-2".to_string();
        store.create_object(&other, None).await.unwrap();

        assert_eq!(store.bucket_size("audio").await.unwrap(), 350);
        assert_eq!(store.bucket_size("video").await.unwrap(), 4_000);

        assert_eq!(store.list_objects(Some("audio"), None, 10).await.unwrap().len(), 2);
        assert_eq!(store.list_objects(None, Some("user-2"), 10).await.unwrap().len(), 1);
        assert_eq!(store.list_objects(None, None, 10).await.unwrap().len(), 3);
        assert_eq!(store.list_objects(None, None, 1).await.unwrap().len(), 1);
    })
    .await;
}
