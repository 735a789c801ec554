//! End-to-end engine tests against the in-memory Pod.

use podfs_core::testing::FakePod;
use podfs_core::{Credentials, PodConfig, PodFs, ResourceKind};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const BASE: &str = "https://pod.example/data/";

fn config() -> PodConfig {
    PodConfig::new(Url::parse(BASE).unwrap())
}

fn engine(pod: &Arc<FakePod>) -> Arc<PodFs> {
    PodFs::with_backend(config(), pod.clone())
}

#[tokio::test]
async fn test_create_write_release_uploads_once() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let fh = fs.create("/notes.txt").await.unwrap();
    fs.write(fh, 0, b"hello ").await.unwrap();
    fs.write(fh, 6, b"world").await.unwrap();
    // Nothing uploaded while the handle is open.
    assert_eq!(pod.request_count("PUT", "/notes.txt"), 0);

    fs.release(fh).await.unwrap();
    assert_eq!(pod.request_count("PUT", "/notes.txt"), 1);
    assert_eq!(pod.resource_body("/notes.txt").unwrap(), b"hello world");

    let fh = fs.open("/notes.txt", false, false).await.unwrap();
    let body = fs.read(fh, 0, 1024).await.unwrap();
    assert_eq!(&body[..], b"hello world");
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_touch_uploads_empty_resource() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let fh = fs.create("/empty.bin").await.unwrap();
    fs.release(fh).await.unwrap();
    assert_eq!(pod.resource_body("/empty.bin").unwrap(), b"");
}

#[tokio::test]
async fn test_write_gap_zero_fills() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let fh = fs.create("/sparse.bin").await.unwrap();
    fs.write(fh, 3, b"abc").await.unwrap();
    fs.release(fh).await.unwrap();
    assert_eq!(pod.resource_body("/sparse.bin").unwrap(), b"\0\0\0abc");
}

#[tokio::test]
async fn test_read_past_eof_is_empty() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"hi", "text/plain");
    let fs = engine(&pod);

    let fh = fs.open("/a.txt", false, false).await.unwrap();
    assert_eq!(&fs.read(fh, 1, 10).await.unwrap()[..], b"i");
    assert!(fs.read(fh, 10, 4).await.unwrap().is_empty());
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_readdir_lists_members_with_kinds() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/top.txt", b"x", "text/plain");
    pod.put_resource("/dir/nested.txt", b"y", "text/plain");
    let fs = engine(&pod);

    let entries = fs.readdir("/").await.unwrap();
    let summary: Vec<(&str, ResourceKind)> =
        entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    assert_eq!(
        summary,
        vec![
            ("dir", ResourceKind::Container),
            ("top.txt", ResourceKind::Resource),
        ]
    );

    fs.mkdir("/made").await.unwrap();
    let entries = fs.readdir("/").await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.name == "made" && e.kind == ResourceKind::Container));

    fs.rmdir("/made").await.unwrap();
    let entries = fs.readdir("/").await.unwrap();
    assert!(!entries.iter().any(|e| e.name == "made"));
    assert!(!pod.contains("/made"));
}

#[tokio::test]
async fn test_deep_path_resolves_through_listings() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/x/y/z.txt", b"deep", "text/plain");
    let fs = engine(&pod);

    let attr = fs.getattr("/x/y/z.txt").await.unwrap();
    assert_eq!(attr.kind, ResourceKind::Resource);
    assert_eq!(attr.size, 4);

    let err = fs.getattr("/x/missing/z.txt").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_rmdir_refuses_populated_container() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/dir/nested.txt", b"y", "text/plain");
    let fs = engine(&pod);

    let err = fs.rmdir("/dir").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert!(pod.contains("/dir"));

    fs.unlink("/dir/nested.txt").await.unwrap();
    fs.rmdir("/dir").await.unwrap();
    assert!(!pod.contains("/dir"));
}

#[tokio::test]
async fn test_unlink_removes_locally_and_remotely() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"x", "text/plain");
    let fs = engine(&pod);

    fs.unlink("/a.txt").await.unwrap();
    assert!(!pod.contains("/a.txt"));
    let err = fs.getattr("/a.txt").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_getattr_reports_pending_size_while_open() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let fh = fs.create("/grow.txt").await.unwrap();
    assert_eq!(fs.getattr("/grow.txt").await.unwrap().size, 0);

    fs.write(fh, 0, b"12345").await.unwrap();
    let attr = fs.getattr("/grow.txt").await.unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(attr.kind, ResourceKind::Resource);

    fs.release(fh).await.unwrap();
    assert_eq!(fs.getattr("/grow.txt").await.unwrap().size, 5);
}

#[tokio::test]
async fn test_wac_allow_shapes_permission_bits() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/ro.txt", b"x", "text/plain");
    pod.set_wac_allow("/ro.txt", "user=\"read\",public=\"read\"");
    let fs = engine(&pod);

    assert_eq!(fs.getattr("/ro.txt").await.unwrap().mode, 0o400);
}

#[tokio::test]
async fn test_mime_type_xattr_set_at_create_only() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let fh = fs.create("/doc.md").await.unwrap();
    fs.setxattr("/doc.md", "user.mime_type", "text/x-custom")
        .await
        .unwrap();
    fs.write(fh, 0, b"# hi").await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(
        fs.getxattr("/doc.md", "user.mime_type").await.unwrap(),
        "text/x-custom"
    );
    // The first upload froze the content type.
    let err = fs
        .setxattr("/doc.md", "user.mime_type", "text/plain")
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EACCES);
}

#[tokio::test]
async fn test_xattr_namespace_is_fixed() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"x", "text/plain");
    let fs = engine(&pod);

    let err = fs.getxattr("/a.txt", "user.other").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTSUP);

    let err = fs
        .setxattr("/a.txt", "user.pod.etag", "\"forged\"")
        .await
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EACCES);

    let names = fs.listxattr("/a.txt").unwrap();
    assert!(names.contains(&"user.mime_type"));
    assert!(names.contains(&"user.pod.url"));
    assert_eq!(names.len(), 5);

    // Header mirrors come from the store.
    let etag = fs.getxattr("/a.txt", "user.pod.etag").await.unwrap();
    assert!(etag.starts_with('"'));
    let url = fs.getxattr("/a.txt", "user.pod.url").await.unwrap();
    assert_eq!(url, format!("{BASE}a.txt"));
}

#[tokio::test]
async fn test_stale_body_revalidates_with_etag() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"cached", "text/plain");
    let fs = PodFs::with_backend(config().cache_ttl(Duration::ZERO), pod.clone());

    let fh = fs.open("/a.txt", false, false).await.unwrap();
    let first = fs.read(fh, 0, 64).await.unwrap();
    let second = fs.read(fh, 0, 64).await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(first, second);
    // Second read went out as a conditional GET and came back 304.
    assert_eq!(pod.request_count("GET", "/a.txt"), 2);
}

#[tokio::test]
async fn test_fresh_body_served_without_refetch() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"cached", "text/plain");
    let fs = engine(&pod);

    let fh = fs.open("/a.txt", false, false).await.unwrap();
    fs.read(fh, 0, 64).await.unwrap();
    fs.read(fh, 0, 64).await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(pod.request_count("GET", "/a.txt"), 1);
}

#[tokio::test]
async fn test_caching_disabled_sees_external_updates() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/live.txt", b"one", "text/plain");
    let fs = PodFs::with_backend(config().content_caching(false), pod.clone());

    let fh = fs.open("/live.txt", false, false).await.unwrap();
    assert_eq!(&fs.read(fh, 0, 16).await.unwrap()[..], b"one");

    pod.put_resource("/live.txt", b"two", "text/plain");
    assert_eq!(&fs.read(fh, 0, 16).await.unwrap()[..], b"two");
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_rename_resource_moves_content() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/old.txt", b"payload", "text/plain");
    let fs = engine(&pod);

    fs.rename("/old.txt", "/new.txt").await.unwrap();
    assert!(!pod.contains("/old.txt"));
    assert_eq!(pod.resource_body("/new.txt").unwrap(), b"payload");

    assert_eq!(fs.getattr("/new.txt").await.unwrap().size, 7);
    let err = fs.getattr("/old.txt").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_rename_delete_failure_leaves_both_paths_live() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/old.txt", b"payload", "text/plain");
    let fs = engine(&pod);

    pod.fail_deletes(true);
    let err = fs.rename("/old.txt", "/new.txt").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EAGAIN);

    // The copy went through before the delete failed: both live, and
    // both stay reachable through the mount.
    assert!(pod.contains("/old.txt"));
    assert!(pod.contains("/new.txt"));
    pod.fail_deletes(false);
    assert!(fs.getattr("/old.txt").await.is_ok());
    assert!(fs.getattr("/new.txt").await.is_ok());
}

#[tokio::test]
async fn test_rename_container_empty_only() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_container("/dir");
    pod.put_resource("/full/x.txt", b"x", "text/plain");
    let fs = engine(&pod);

    fs.rename("/dir", "/moved").await.unwrap();
    assert!(!pod.contains("/dir"));
    assert!(pod.contains("/moved"));
    assert!(fs.readdir("/moved").await.unwrap().is_empty());

    let err = fs.rename("/full", "/elsewhere").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTSUP);
    assert!(pod.contains("/full/x.txt"));
}

#[tokio::test]
async fn test_truncate_without_open_handle() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/t.txt", b"abcdef", "text/plain");
    let fs = engine(&pod);

    fs.truncate("/t.txt", 3).await.unwrap();
    assert_eq!(pod.resource_body("/t.txt").unwrap(), b"abc");

    fs.truncate("/t.txt", 6).await.unwrap();
    assert_eq!(pod.resource_body("/t.txt").unwrap(), b"abc\0\0\0");
}

#[tokio::test]
async fn test_truncate_through_open_buffer_defers_upload() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/t.txt", b"abcdef", "text/plain");
    let fs = engine(&pod);

    let fh = fs.open("/t.txt", true, false).await.unwrap();
    fs.truncate("/t.txt", 2).await.unwrap();
    assert_eq!(fs.getattr("/t.txt").await.unwrap().size, 2);
    assert_eq!(pod.request_count("PUT", "/t.txt"), 0);

    fs.release(fh).await.unwrap();
    assert_eq!(pod.resource_body("/t.txt").unwrap(), b"ab");
}

#[tokio::test]
async fn test_bearer_token_attached_and_rotated_on_401() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"secret", "text/plain");
    pod.put_resource("/b.txt", b"secret", "text/plain");
    pod.serve_tokens("token-1", 3600);
    pod.require_token(true);

    let fs = PodFs::with_backend(
        config().credentials(Credentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
            token_url: Url::parse("https://idp.example/token").unwrap(),
        }),
        pod.clone(),
    );

    fs.getattr("/a.txt").await.unwrap();
    assert_eq!(pod.token_requests(), 1);
    let headers = pod.last_request_headers();
    assert!(headers
        .iter()
        .any(|(n, v)| n == "Authorization" && v == "Bearer token-1"));

    // The store rotates its accepted token: the cached one now gets a
    // 401, which triggers exactly one re-mint and retry.
    pod.serve_tokens("token-2", 3600);
    fs.getattr("/b.txt").await.unwrap();
    assert_eq!(pod.token_requests(), 2);
}

#[tokio::test]
async fn test_concurrent_writes_to_distinct_paths() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let left = {
        let fs = Arc::clone(&fs);
        tokio::spawn(async move {
            let fh = fs.create("/left.txt").await.unwrap();
            fs.write(fh, 0, b"left").await.unwrap();
            fs.release(fh).await.unwrap();
        })
    };
    let right = {
        let fs = Arc::clone(&fs);
        tokio::spawn(async move {
            let fh = fs.create("/right.txt").await.unwrap();
            fs.write(fh, 0, b"right").await.unwrap();
            fs.release(fh).await.unwrap();
        })
    };
    left.await.unwrap();
    right.await.unwrap();

    assert_eq!(pod.resource_body("/left.txt").unwrap(), b"left");
    assert_eq!(pod.resource_body("/right.txt").unwrap(), b"right");
}

#[tokio::test]
async fn test_readdir_sees_external_member_within_freshness_window() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/a.txt", b"x", "text/plain");
    let fs = engine(&pod);

    let names: Vec<String> = fs
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["a.txt"]);

    // Another client adds a member. Listings are revalidated against the
    // container on every readdir, so it shows up immediately even inside
    // the freshness window.
    pod.put_resource("/b.txt", b"y", "text/plain");
    let names: Vec<String> = fs
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["a.txt", "b.txt"]);
    assert_eq!(pod.request_count("GET", "/"), 2);
}

#[tokio::test]
async fn test_concurrent_reads_of_one_path_share_one_fetch() {
    let pod = Arc::new(FakePod::new(BASE));
    pod.put_resource("/shared.txt", b"same for everyone", "text/plain");
    let fs = engine(&pod);

    // First read populates the cache.
    let fh = fs.open("/shared.txt", false, false).await.unwrap();
    fs.read(fh, 0, 64).await.unwrap();
    fs.release(fh).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let fh = fs.open("/shared.txt", false, false).await.unwrap();
            let body = fs.read(fh, 0, 64).await.unwrap();
            fs.release(fh).await.unwrap();
            body
        }));
    }
    for task in tasks {
        assert_eq!(&task.await.unwrap()[..], b"same for everyone");
    }
    // Everyone was served from the cached body inside the window.
    assert_eq!(pod.request_count("GET", "/shared.txt"), 1);
}

#[tokio::test]
async fn test_concurrent_bearer_calls_mint_once() {
    use podfs_core::auth::CredentialManager;

    let pod = Arc::new(FakePod::new(BASE));
    pod.serve_tokens("tok", 3600);
    let manager = Arc::new(CredentialManager::new(
        Credentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
            token_url: Url::parse("https://idp.example/token").unwrap(),
        },
        pod.clone(),
    ));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move { manager.bearer().await.unwrap() }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().as_deref(), Some("tok"));
    }
    // All callers raced on an empty cache; the mutex let exactly one
    // mint through and the rest observed its token.
    assert_eq!(pod.token_requests(), 1);
}

#[tokio::test]
async fn test_invalid_paths_rejected_before_network() {
    let pod = Arc::new(FakePod::new(BASE));
    let fs = engine(&pod);

    let err = fs.getattr("relative/path").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EINVAL);

    let long = format!("/{}", "x".repeat(2000));
    let err = fs.getattr(&long).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENAMETOOLONG);

    assert_eq!(pod.request_count("GET", "/"), 0);
    assert_eq!(pod.request_count("HEAD", "/"), 0);
}
