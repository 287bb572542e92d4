//! Integration tests for storage folder registration, resizing and removal

mod common;

use std::path::Path;
use std::time::Duration;

use blob_store::{events, BlobStoreError, ErrorKind, FileBlobManager, StorageFolderConfig};
use common::{add, digest, status_of, CONTENT};
use tokio_util::sync::CancellationToken;

const OTHER: &[u8] = b"Some other content, a bit longer than the first one";
const THIRD: &[u8] = b"A third content for the same folder";

fn write_file(path: &Path, size: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![b'z'; size]).unwrap();
}

/// Make `folder` look like a storage folder that held no blob.
fn write_empty_metadata(folder: &Path) {
    std::fs::create_dir_all(folder).unwrap();
    std::fs::write(folder.join("metadata.json"), br#"{"blobs":[]}"#).unwrap();
}

#[tokio::test]
async fn test_duplicate_folder_is_rejected() {
    let (_temp, root) = common::temp_dir();
    let folder = root.join("blobs");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();

    for alias in [
        folder.clone(),
        folder.join("."),
        folder.join("..").join("blobs"),
    ] {
        let err = manager
            .add_folder(StorageFolderConfig::new(&alias, 1000))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BlobStoreError::FolderAlreadyRegistered { .. }),
            "{} was accepted: {err}",
            alias.display()
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[cfg(unix)]
    {
        let link = root.join("link");
        std::os::unix::fs::symlink(&folder, &link).unwrap();
        let err = manager
            .add_folder(StorageFolderConfig::new(&link, 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::FolderAlreadyRegistered { .. }));
    }

    assert_eq!(manager.folder_status().len(), 1);
}

#[tokio::test]
async fn test_concurrent_registration_of_same_folder() {
    let (_temp, folder) = common::temp_dir();
    let manager = FileBlobManager::new();

    let (first, second) = tokio::join!(
        manager.add_folder(StorageFolderConfig::new(&folder, 1000)),
        manager.add_folder(StorageFolderConfig::new(&folder, 2000)),
    );
    assert!(first.is_ok() != second.is_ok());
    assert_eq!(manager.folder_status().len(), 1);
}

#[tokio::test]
async fn test_leftovers_are_swept_on_registration() {
    let (logs, _guard) = common::LogCapture::install();
    let (_temp, folder) = common::temp_dir();
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    manager.remove_folder(&folder).await.unwrap();
    drop(manager);

    let stuck_a = folder.join("ab").join("cd").join("leftover");
    let stuck_b = folder.join("ef").join("Some other file.txt");
    let writable = folder.join("12").join("34").join("writable");
    write_file(&stuck_a, 36);
    write_file(&stuck_b, 63);
    write_file(&writable, 10);

    let (manager, remover) = common::manager_denying_removal();
    remover.deny(&stuck_a);
    remover.deny(&stuck_b);
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();

    let status = status_of(&manager, &folder);
    assert_eq!(status.zombies_size, 99);
    assert_eq!(status.current_size, 99);
    assert_eq!(logs.count(events::ZOMBIE_DELETE_FAILED), 2);

    assert!(stuck_a.exists());
    assert!(stuck_b.exists());
    assert!(!writable.exists());
    assert!(!folder.join("12").exists());
}

#[tokio::test]
async fn test_unregistered_folder_with_files_is_refused() {
    let (_temp, folder) = common::temp_dir();
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    // Never persisted, the folder has no metadata.
    drop(manager);
    let thesis = folder.join("docs").join("thesis.tex");
    write_file(&thesis, 40);

    let manager = FileBlobManager::new();
    let err = manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobStoreError::FolderNotEmpty(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(manager.folder_status().is_empty());
    assert!(thesis.exists());
    assert!(common::blob_file(&folder, id).exists());
}

#[tokio::test]
async fn test_unregistered_folder_with_empty_directories_is_accepted() {
    let (_temp, folder) = common::temp_dir();
    std::fs::create_dir_all(folder.join("ab").join("cd")).unwrap();

    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    assert_eq!(status_of(&manager, &folder).current_size, 0);
    assert!(!folder.join("ab").exists());
}

#[tokio::test]
async fn test_resize_within_usage() {
    let (_temp, folder) = common::temp_dir();
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    add(&manager, CONTENT, digest(1)).await;
    let used = status_of(&manager, &folder).current_size;

    manager
        .update_folder(StorageFolderConfig::new(&folder, 5000))
        .await
        .unwrap();
    assert_eq!(status_of(&manager, &folder).maximum_size, 5000);

    manager
        .update_folder(StorageFolderConfig::new(&folder, used))
        .await
        .unwrap();
    let status = status_of(&manager, &folder);
    assert_eq!(status.maximum_size, used);
    assert_eq!(status.current_size, used);
}

#[tokio::test]
async fn test_shrink_without_room_elsewhere_changes_nothing() {
    let (_temp, folder) = common::temp_dir();
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    let before = status_of(&manager, &folder);

    let err = manager
        .update_folder(StorageFolderConfig::new(&folder, 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
    assert_eq!(status_of(&manager, &folder), before);
    assert!(manager.lock(id).await.is_ok());
}

#[tokio::test]
async fn test_shrink_below_zombies_is_irreclaimable() {
    let (_temp, folder) = common::temp_dir();
    write_empty_metadata(&folder);
    let stuck = folder.join("leftover");
    write_file(&stuck, 99);
    let (manager, remover) = common::manager_denying_removal();
    remover.deny(&stuck);
    manager
        .add_folder(StorageFolderConfig::new(&folder, 1000))
        .await
        .unwrap();
    let before = status_of(&manager, &folder);

    let err = manager
        .update_folder(StorageFolderConfig::new(&folder, 50))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BlobStoreError::IrreclaimableCapacity { zombies: 99, .. }
    ));
    assert_eq!(err.kind(), ErrorKind::IrreclaimableCapacity);
    assert_eq!(status_of(&manager, &folder), before);
}

#[tokio::test]
async fn test_shrink_moves_blobs_out() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let ids = [
        add(&manager, CONTENT, digest(1)).await,
        add(&manager, OTHER, digest(2)).await,
        add(&manager, THIRD, digest(3)).await,
    ];
    let used = status_of(&manager, &source).current_size;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    manager
        .update_folder(StorageFolderConfig::new(&source, used - 1))
        .await
        .unwrap();

    let source_status = status_of(&manager, &source);
    let target_status = status_of(&manager, &target);
    assert_eq!(source_status.maximum_size, used - 1);
    assert!(source_status.current_size < used);
    assert!(target_status.current_size > 0);
    assert_eq!(source_status.current_size + target_status.current_size, used);

    for (id, content) in ids.into_iter().zip([CONTENT, OTHER, THIRD]) {
        let lock = manager.lock(id).await.unwrap();
        assert_eq!(lock.read_content().await.unwrap(), content);
    }
    assert_eq!(
        common::files_in(&source).len() + common::files_in(&target).len(),
        3
    );
}

#[tokio::test]
async fn test_remove_folder_moves_everything() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let first = add(&manager, CONTENT, digest(1)).await;
    let second = add(&manager, OTHER, digest(2)).await;
    let used = status_of(&manager, &source).current_size;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    manager.remove_folder(&source).await.unwrap();

    let statuses = manager.folder_status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].path, target);
    assert_eq!(statuses[0].current_size, used);
    assert!(common::files_in(&source).is_empty());

    let lock = manager.lock(first).await.unwrap();
    assert!(lock.path().starts_with(&target));
    assert_eq!(lock.read_content().await.unwrap(), CONTENT);
    let lock = manager.lock(second).await.unwrap();
    assert_eq!(lock.read_content().await.unwrap(), OTHER);

    // Deduplication still finds the moved blobs.
    assert_eq!(add(&manager, CONTENT, digest(1)).await, first);
}

#[tokio::test]
async fn test_remove_folder_waits_for_locked_blobs_only() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let locked = add(&manager, CONTENT, digest(1)).await;
    let unlocked = add(&manager, OTHER, digest(2)).await;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    let lock = manager.lock(locked).await.unwrap();
    let locked_size = lock.compressed_size();
    let removal = tokio::spawn({
        let manager = manager.clone();
        let source = source.clone();
        async move { manager.remove_folder(&source).await }
    });

    // The unlocked blob moves right away.
    common::eventually(|| status_of(&manager, &source).current_size == locked_size).await;
    let moved = manager.lock(unlocked).await.unwrap();
    assert!(moved.path().starts_with(&target));
    drop(moved);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!removal.is_finished());
    assert!(lock.path().exists());
    assert!(lock.path().starts_with(&source));

    let old_path = lock.path().to_path_buf();
    drop(lock);
    tokio::time::timeout(Duration::from_secs(5), removal)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!old_path.exists());
    assert_eq!(manager.folder_status().len(), 1);
    let lock = manager.lock(locked).await.unwrap();
    assert!(lock.path().starts_with(&target));
    assert_eq!(lock.read_content().await.unwrap(), CONTENT);
}

#[tokio::test]
async fn test_remove_folder_waits_for_empty_blob_being_written() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    manager
        .add_folder(StorageFolderConfig::new(&target, 500))
        .await
        .unwrap();

    let adding = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .add_blob(&b""[..], 0, digest(9), &CancellationToken::new())
                .await
        }
    });
    // Let the ingestion register its blob in the source.
    tokio::task::yield_now().await;

    tokio::time::timeout(Duration::from_secs(5), manager.remove_folder(&source))
        .await
        .unwrap()
        .unwrap();
    let id = adding.await.unwrap().unwrap();

    assert_eq!(manager.folder_status().len(), 1);
    let lock = manager.lock(id).await.unwrap();
    assert!(lock.path().starts_with(&target));
    assert!(lock.read_content().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_folder_operations_run_in_order() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    let lock = manager.lock(id).await.unwrap();
    let removal = tokio::spawn({
        let manager = manager.clone();
        let source = source.clone();
        async move { manager.remove_folder(&source).await }
    });
    common::eventually(|| common::blob_file(&target, id).exists()).await;

    let resize = tokio::spawn({
        let manager = manager.clone();
        let target = target.clone();
        async move {
            manager
                .update_folder(StorageFolderConfig::new(&target, 2000))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!removal.is_finished());
    assert!(!resize.is_finished());
    assert_eq!(status_of(&manager, &target).maximum_size, 1000);

    drop(lock);
    tokio::time::timeout(Duration::from_secs(5), removal)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), resize)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let statuses = manager.folder_status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].maximum_size, 2000);
}

#[tokio::test]
async fn test_blob_added_to_folder_being_removed_moves_too() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 10_000))
        .await
        .unwrap();
    let first = add(&manager, CONTENT, digest(1)).await;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    let lock = manager.lock(first).await.unwrap();
    let removal = tokio::spawn({
        let manager = manager.clone();
        let source = source.clone();
        async move { manager.remove_folder(&source).await }
    });
    common::eventually(|| common::blob_file(&target, first).exists()).await;

    // The folder being removed still has the most room.
    let second = add(&manager, OTHER, digest(2)).await;
    let check = manager.lock(second).await.unwrap();
    assert!(check.path().starts_with(&source));
    drop(check);

    drop(lock);
    tokio::time::timeout(Duration::from_secs(5), removal)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(manager.folder_status().len(), 1);
    assert!(common::files_in(&source).is_empty());
    let lock = manager.lock(second).await.unwrap();
    assert!(lock.path().starts_with(&target));
    assert_eq!(lock.read_content().await.unwrap(), OTHER);
}

#[tokio::test]
async fn test_remove_folder_without_room_changes_nothing() {
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    manager
        .add_folder(StorageFolderConfig::new(&target, 10))
        .await
        .unwrap();
    let before = manager.folder_status();

    let err = manager.remove_folder(&source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
    assert_eq!(manager.folder_status(), before);
    assert!(manager.lock(id).await.unwrap().path().starts_with(&source));
}

#[tokio::test]
async fn test_unknown_folder() {
    let (_temp, root) = common::temp_dir();
    let manager = FileBlobManager::new();

    let err = manager.remove_folder(root.join("nope")).await.unwrap_err();
    assert!(matches!(err, BlobStoreError::FolderNotFound(_)));
    let err = manager
        .update_folder(StorageFolderConfig::new(root.join("nope"), 10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_failed_migration_copy_leaves_zombie() {
    let (logs, _guard) = common::LogCapture::install();
    let (_temp, root) = common::temp_dir();
    let source = root.join("source");
    let target = root.join("target");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&source, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    let compressed_size = status_of(&manager, &source).current_size;
    manager
        .add_folder(StorageFolderConfig::new(&target, 1000))
        .await
        .unwrap();

    // A directory where the copy should go makes both the copy and its
    // cleanup fail.
    std::fs::create_dir_all(common::blob_file(&target, id)).unwrap();

    let err = manager.remove_folder(&source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(logs.count(events::MIGRATION_COPY_FAILED), 1);

    // The blob stays where it was, the failed copy is a zombie.
    let lock = manager.lock(id).await.unwrap();
    assert!(lock.path().starts_with(&source));
    assert_eq!(lock.read_content().await.unwrap(), CONTENT);
    assert_eq!(manager.folder_status().len(), 2);
    assert_eq!(status_of(&manager, &source).current_size, compressed_size);
    let target_status = status_of(&manager, &target);
    assert_eq!(target_status.zombies_size, compressed_size);
    assert_eq!(target_status.current_size, compressed_size);
}

#[tokio::test]
async fn test_index_conflict_rejects_whole_folder() {
    let (logs, _guard) = common::LogCapture::install();
    let (_temp, root) = common::temp_dir();
    let original = root.join("original");
    let copy = root.join("copy");
    let manager = FileBlobManager::new();
    manager
        .add_folder(StorageFolderConfig::new(&original, 1000))
        .await
        .unwrap();
    let id = add(&manager, CONTENT, digest(1)).await;
    manager.persist_folder_states().await.unwrap();

    // Same blob, claimed by a second folder.
    std::fs::create_dir_all(&copy).unwrap();
    std::fs::copy(original.join("metadata.json"), copy.join("metadata.json")).unwrap();
    write_file(&common::blob_file(&copy, id), 0);
    std::fs::copy(common::blob_file(&original, id), common::blob_file(&copy, id)).unwrap();
    let unrelated = copy.join("unrelated");
    write_file(&unrelated, 5);

    let err = manager
        .add_folder(StorageFolderConfig::new(&copy, 1000))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobStoreError::IndexConflict { id: conflicting, .. } if conflicting == id));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(logs.count(events::FOLDER_INDEX_CONFLICT), 1);

    assert_eq!(manager.folder_status().len(), 1);
    assert!(common::blob_file(&copy, id).exists());
    assert!(unrelated.exists());
}
