mod common;

use artifact_mirror_core::contract::{MetadataStore, MockDownloader, MockMetadataStore, MockUploader};
use artifact_mirror_core::error::Error;
use artifact_mirror_core::model::{Artifact, ArtifactName, Build, BuiltinBuild, ReleaseBuild, Variant};
use artifact_mirror_core::store::SqliteStore;
use artifact_mirror_core::synchronise::Synchroniser;
use bytes::Bytes;
use chrono::Utc;
use common::*;
use mockall::predicate::eq;
use mockall::Sequence;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

async fn store_with_cursor(run_id: i64) -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    let build = Build::Builtin(BuiltinBuild {
        run_id,
        commit_sha: "old".into(),
        description: "already mirrored".into(),
        created_at: Utc::now(),
        artifact_count: 1,
        has_wow64: false,
    });
    let artifact = Artifact::Builtin {
        run_id,
        name: ArtifactName::new("d3d11.dll").unwrap(),
        variant: Variant::Default,
    };
    store.insert_build_with_artifacts(&build, &[artifact]).await.unwrap();
    store
}

async fn store_with_tag(tag: &str) -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    let build = Build::Release(ReleaseBuild {
        tag: tag.into(),
        created_at: Utc::now(),
        artifact_count: 0,
        has_wow64: false,
    });
    store.insert_build_with_artifacts(&build, &[]).await.unwrap();
    store
}

fn default_dll_artifact() -> Bytes {
    run_artifact_zip(&[("x86_64-windows/d3d11.dll", "dll")])
}

#[tokio::test]
async fn new_runs_are_mirrored_oldest_first() {
    let store = store_with_cursor(100).await;
    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .with(eq(1))
        .times(1)
        .returning(|_| Ok(vec![run(105, 1), native_run(103), run(101, 2), run(100, 3)]));

    let mut seq = Sequence::new();
    for run_id in [101, 105] {
        downloader
            .expect_list_run_artifacts()
            .with(eq(run_id))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|run_id| Ok(vec![run_artifact(run_id * 10, "dxmt-release")]));
    }
    downloader
        .expect_download_run_artifact()
        .times(2)
        .returning(|_, _| Ok(default_dll_artifact()));
    no_releases(&mut downloader);

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());

    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.committed_runs(), vec![101, 105]);
    assert!(!report.cancelled);
    assert_eq!(
        keys(&uploads),
        vec!["mirror/builtin/101/d3d11.dll", "mirror/builtin/105/d3d11.dll"]
    );
    assert_eq!(store.max_run_id().await.unwrap(), 105);
    assert!(store.builtin_build(103).await.unwrap().is_none());

    let build = store.builtin_build(105).await.unwrap().expect("run 105 recorded");
    assert_eq!(build.commit_sha, "sha105");
    assert_eq!(build.artifact_count, 1);
    assert!(!build.has_wow64);
}

#[tokio::test]
async fn a_second_cycle_changes_nothing() {
    let store = store_with_cursor(100).await;
    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .times(2)
        .returning(|_| Ok(vec![run(102, 1), run(101, 1), run(100, 1)]));
    downloader
        .expect_list_run_artifacts()
        .times(2)
        .returning(|run_id| Ok(vec![run_artifact(run_id, "dxmt-release")]));
    downloader
        .expect_download_run_artifact()
        .times(2)
        .returning(|_, _| Ok(default_dll_artifact()));
    no_releases(&mut downloader);

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    let cancel = CancellationToken::new();

    let first = engine.run_cycle(&cancel).await.unwrap();
    let builds_after_first = store.list_builds(1, 50).await.unwrap();
    let second = engine.run_cycle(&cancel).await.unwrap();

    assert_eq!(first.committed_runs(), vec![101, 102]);
    assert!(second.builtin.is_empty());
    assert_eq!(uploads.lock().unwrap().len(), 2);
    assert_eq!(store.list_builds(1, 50).await.unwrap(), builds_after_first);
}

#[tokio::test]
async fn discovery_stops_at_the_recorded_run_without_reading_further_pages() {
    let store = store_with_cursor(110).await;
    let mut downloader = MockDownloader::new();
    // A full page (30 runs, 130 down to 101) whose tail is already recorded.
    downloader
        .expect_list_runs()
        .with(eq(1))
        .times(1)
        .returning(|_| Ok((101..=130).rev().map(|id| run(id, 1)).collect()));
    downloader
        .expect_list_run_artifacts()
        .times(20)
        .returning(|_| Ok(vec![]));
    no_releases(&mut downloader);

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store.clone());
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    let seen: Vec<String> = report.builtin.iter().map(|u| u.unit.to_string()).collect();
    assert_eq!(seen.first().map(String::as_str), Some("run 111"));
    assert_eq!(seen.last().map(String::as_str), Some("run 130"));
    // Nothing retained, so nothing recorded and the cursor does not move.
    assert!(report.committed_runs().is_empty());
    assert_eq!(store.max_run_id().await.unwrap(), 110);
}

#[tokio::test]
async fn runs_older_than_the_retention_window_end_discovery() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .times(1)
        .returning(|_| Ok(vec![run(300, 1), run(200, 101), run(150, 1)]));
    downloader
        .expect_list_run_artifacts()
        .with(eq(300))
        .times(1)
        .returning(|_| Ok(vec![run_artifact(1, "dxmt-release")]));
    downloader
        .expect_download_run_artifact()
        .times(1)
        .returning(|_, _| Ok(default_dll_artifact()));
    no_releases(&mut downloader);

    let (uploader, _uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.committed_runs(), vec![300]);
    assert!(store.builtin_build(150).await.unwrap().is_none());
}

#[tokio::test]
async fn full_pages_are_followed_and_overlapping_runs_processed_once() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut config = config();
    config.page_size = 2;

    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .with(eq(1))
        .returning(|_| Ok(vec![run(104, 1), run(103, 1)]));
    // Run 103 shows up again, as when a run is published between requests.
    downloader
        .expect_list_runs()
        .with(eq(2))
        .returning(|_| Ok(vec![run(103, 1), run(102, 1)]));
    downloader
        .expect_list_runs()
        .with(eq(3))
        .returning(|_| Ok(vec![]));

    let mut seq = Sequence::new();
    for run_id in [102, 103, 104] {
        downloader
            .expect_list_run_artifacts()
            .with(eq(run_id))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|run_id| Ok(vec![run_artifact(run_id, "dxmt-release")]));
    }
    downloader
        .expect_download_run_artifact()
        .times(3)
        .returning(|_, _| Ok(default_dll_artifact()));
    no_releases(&mut downloader);

    let (uploader, _uploads) = recording_uploader();
    let engine = Synchroniser::new(config, downloader, uploader, store);
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.committed_runs(), vec![102, 103, 104]);
}

#[tokio::test]
async fn artifact_and_file_filters_decide_what_is_mirrored() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .returning(|_| Ok(vec![run(101, 1)]));
    downloader.expect_list_run_artifacts().returning(|_| {
        let mut expired = run_artifact(1, "dxmt-release");
        expired.expired = true;
        Ok(vec![
            expired,
            run_artifact(2, "dxmt-release-gcc"),
            run_artifact(3, "dxmt-debug"),
            run_artifact(4, "dxmt-Release"),
            run_artifact(5, "dxmt-release-wow64"),
        ])
    });
    downloader
        .expect_download_run_artifact()
        .with(eq(101), eq(4))
        .times(1)
        .returning(|_, _| {
            Ok(run_artifact_zip(&[
                ("x86_64-windows/d3d11.dll", "d3d11 x64"),
                ("x86_64-unix/winemetal.so", "metal"),
                ("README.md", "docs"),
            ]))
        });
    downloader
        .expect_download_run_artifact()
        .with(eq(101), eq(5))
        .times(1)
        .returning(|_, _| {
            Ok(run_artifact_zip(&[
                ("i386-windows/d3d11.dll", "d3d11 x86"),
                ("i386-windows/winemetal.so", "not for compat"),
            ]))
        });
    no_releases(&mut downloader);

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    let recorded = uploads.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            ("mirror/builtin/101/winemetal.so".to_string(), "metal".to_string()),
            ("mirror/builtin/101/d3d11.dll".to_string(), "d3d11 x64".to_string()),
            ("mirror/builtin/101/wow64/d3d11.dll".to_string(), "d3d11 x86".to_string()),
        ]
    );

    let build = store.builtin_build(101).await.unwrap().unwrap();
    assert_eq!(build.artifact_count, 3);
    assert!(build.has_wow64);
    assert_eq!(
        store.builtin_artifacts(101, Some(Variant::Compat)).await.unwrap().len(),
        1
    );
    assert_eq!(
        store.builtin_artifacts(101, Some(Variant::Default)).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn same_file_name_in_both_variants_is_kept_apart() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(|_| Ok(vec![run(7, 1)]));
    downloader.expect_list_run_artifacts().returning(|_| {
        Ok(vec![
            run_artifact(1, "dxmt-release"),
            run_artifact(2, "dxmt-release-wow64"),
        ])
    });
    downloader
        .expect_download_run_artifact()
        .returning(|_, artifact_id| {
            let body = if artifact_id == 1 { "64-bit" } else { "32-bit" };
            Ok(run_artifact_zip(&[("lib/lib.dll", body)]))
        });
    no_releases(&mut downloader);

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    let recorded = uploads.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], ("mirror/builtin/7/lib.dll".into(), "64-bit".into()));
    assert_eq!(recorded[1], ("mirror/builtin/7/wow64/lib.dll".into(), "32-bit".into()));
    assert_eq!(store.builtin_artifacts(7, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_names_within_a_variant_are_uploaded_once() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(|_| Ok(vec![run(9, 1)]));
    downloader
        .expect_list_run_artifacts()
        .returning(|_| Ok(vec![run_artifact(1, "dxmt-release")]));
    downloader.expect_download_run_artifact().returning(|_, _| {
        Ok(run_artifact_zip(&[
            ("a/dxgi.dll", "first"),
            ("b/dxgi.dll", "second"),
        ]))
    });
    no_releases(&mut downloader);

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        uploads.lock().unwrap().clone(),
        vec![("mirror/builtin/9/dxgi.dll".to_string(), "first".to_string())]
    );
    assert_eq!(store.builtin_build(9).await.unwrap().unwrap().artifact_count, 1);
}

#[tokio::test]
async fn runs_without_retained_files_are_not_recorded() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(|_| Ok(vec![run(12, 1), run(11, 1)]));
    downloader
        .expect_list_run_artifacts()
        .returning(|run_id| Ok(vec![run_artifact(run_id, "dxmt-release")]));
    // Run 11 ships no inner tarball, run 12 ships a corrupt zip.
    downloader
        .expect_download_run_artifact()
        .with(eq(11), eq(11))
        .returning(|_, _| Ok(zip_without_archive()));
    downloader
        .expect_download_run_artifact()
        .with(eq(12), eq(12))
        .returning(|_, _| Ok(Bytes::from_static(b"definitely not a zip")));
    no_releases(&mut downloader);

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store.clone());
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.builtin.len(), 2);
    assert!(report.committed_runs().is_empty());
    assert_eq!(store.max_run_id().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_upload_leaves_the_unit_for_the_next_cycle() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(|_| Ok(vec![run(42, 1)]));
    downloader
        .expect_list_run_artifacts()
        .times(2)
        .returning(|_| Ok(vec![run_artifact(1, "dxmt-release")]));
    downloader
        .expect_download_run_artifact()
        .times(2)
        .returning(|_, _| {
            Ok(run_artifact_zip(&[
                ("x86_64-windows/d3d11.dll", "a"),
                ("x86_64-windows/dxgi.dll", "b"),
            ]))
        });
    no_releases(&mut downloader);

    // The second upload of the first cycle fails.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut uploader = MockUploader::new();
    uploader.expect_upload().returning(move |_, key| {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(Error::upload(
                key,
                std::io::Error::new(std::io::ErrorKind::Other, "bucket unavailable"),
            ));
        }
        Ok(())
    });

    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    let cancel = CancellationToken::new();

    let err = engine.run_cycle(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Upload { .. }));
    assert_eq!(store.max_run_id().await.unwrap(), 0);

    let report = engine.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.committed_runs(), vec![42]);
    assert_eq!(store.builtin_artifacts(42, None).await.unwrap().len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn provider_errors_abort_the_cycle() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(|_| {
        Err(Error::ProviderStatus {
            url: "https://api.github.com/repos/3Shain/dxmt/actions/runs".into(),
            status: 502,
        })
    });

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store);
    let err = engine.run_cycle(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::ProviderStatus { status: 502, .. }));
}

#[tokio::test]
async fn releases_are_mirrored_until_the_first_recorded_tag() {
    let store = store_with_tag("v0.50").await;
    let mut downloader = MockDownloader::new();
    no_runs(&mut downloader);
    downloader.expect_list_releases().times(1).returning(|_| {
        let mut draft = release(2, "v0.70-draft", &[20]);
        draft.draft = true;
        let mut pre = release(3, "v0.65-rc1", &[30]);
        pre.prerelease = true;
        Ok(vec![
            draft,
            pre,
            release(4, "v0.62", &[40]),
            release(5, "v0.60", &[50]),
            release(6, "v0.50", &[60]),
            release(7, "v0.40", &[70]),
        ])
    });

    let mut seq = Sequence::new();
    for (release_id, asset_id) in [(5, 50), (4, 40)] {
        downloader
            .expect_download_release_asset()
            .with(eq(release_id), eq(asset_id))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(Bytes::from(tar_gz(&[
                    ("i386-windows/d3d11.dll", "x86"),
                    ("x86_64-windows/d3d11.dll", "x64"),
                    ("x86_64-unix/winemetal.so", "unix"),
                    ("share/doc.txt", "ignored"),
                ])))
            });
    }

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.committed_tags(), vec!["v0.60", "v0.62"]);
    assert_eq!(
        keys(&uploads)[..3],
        [
            "mirror/release/v0.60/wow64/d3d11.dll",
            "mirror/release/v0.60/d3d11.dll",
            "mirror/release/v0.60/winemetal.so",
        ]
    );
    assert!(store.release_build("v0.70-draft").await.unwrap().is_none());
    assert!(store.release_build("v0.40").await.unwrap().is_none());

    let build = store.release_build("v0.62").await.unwrap().unwrap();
    assert_eq!(build.artifact_count, 3);
    assert!(build.has_wow64);
}

#[tokio::test]
async fn release_without_assets_is_recorded_empty() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    no_runs(&mut downloader);
    downloader
        .expect_list_releases()
        .returning(|_| Ok(vec![release(1, "v0.1", &[])]));

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store.clone());
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.committed_tags(), vec!["v0.1"]);
    let build = store.release_build("v0.1").await.unwrap().unwrap();
    assert_eq!(build.artifact_count, 0);
    assert!(!build.has_wow64);
}

#[tokio::test]
async fn unreadable_release_asset_is_recorded_empty_and_never_retried() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    no_runs(&mut downloader);
    downloader
        .expect_list_releases()
        .times(2)
        .returning(|_| Ok(vec![release(1, "v0.2", &[11])]));
    downloader
        .expect_download_release_asset()
        .times(1)
        .returning(|_, _| Ok(Bytes::from_static(b"this is not gzip")));

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store.clone());
    let cancel = CancellationToken::new();

    let first = engine.run_cycle(&cancel).await.unwrap();
    let second = engine.run_cycle(&cancel).await.unwrap();

    assert_eq!(first.committed_tags(), vec!["v0.2"]);
    assert!(second.releases.is_empty());
    let build = store.release_build("v0.2").await.unwrap().unwrap();
    assert_eq!(build.artifact_count, 0);
    assert!(!build.has_wow64);
}

#[tokio::test]
async fn release_with_only_default_dirs_has_no_wow64() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    no_runs(&mut downloader);
    downloader
        .expect_list_releases()
        .returning(|_| Ok(vec![release(1, "v0.3", &[5])]));
    downloader.expect_download_release_asset().returning(|_, _| {
        Ok(Bytes::from(tar_gz(&[("x86_64-windows/nested/dxgi.dll", "x64")])))
    });

    let (uploader, uploads) = recording_uploader();
    let engine = Synchroniser::new(config(), downloader, uploader, store.clone());
    engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(keys(&uploads), vec!["mirror/release/v0.3/dxgi.dll"]);
    let artifacts = store.release_artifacts("v0.3", None).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert!(!store.release_build("v0.3").await.unwrap().unwrap().has_wow64);
}

#[tokio::test]
async fn cancellation_is_observed_between_units() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    downloader
        .expect_list_runs()
        .returning(|_| Ok(vec![run(2, 1), run(1, 1)]));

    let cancel = CancellationToken::new();
    cancel.cancel();

    let engine = Synchroniser::new(config(), downloader, MockUploader::new(), store.clone());
    let report = engine.run_cycle(&cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(report.builtin.is_empty());
    assert_eq!(store.max_run_id().await.unwrap(), 0);
}

#[tokio::test]
async fn scheduler_returns_once_cancelled() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut downloader = MockDownloader::new();
    no_runs(&mut downloader);
    no_releases(&mut downloader);

    let mut config = config();
    config.interval = Duration::from_secs(3600);
    let engine = Arc::new(Synchroniser::new(config, downloader, MockUploader::new(), store));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should stop promptly")
        .unwrap();
}

#[tokio::test]
async fn page_size_above_provider_cap_still_follows_full_pages() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut config = config();
    config.page_size = 150;

    let mut downloader = MockDownloader::new();
    // The provider never returns more than 100 runs per page.
    downloader
        .expect_list_runs()
        .with(eq(1))
        .times(1)
        .returning(|_| Ok((201..=300).rev().map(|id| run(id, 1)).collect()));
    downloader
        .expect_list_runs()
        .with(eq(2))
        .times(1)
        .returning(|_| Ok(vec![run(200, 1), run(199, 1)]));
    downloader
        .expect_list_run_artifacts()
        .times(102)
        .returning(|_| Ok(vec![]));
    no_releases(&mut downloader);

    let engine = Synchroniser::new(config, downloader, MockUploader::new(), store);
    let report = engine.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.builtin.len(), 102);
    assert_eq!(report.builtin[0].unit.to_string(), "run 199");
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_the_next_cycle_after_a_failed_one() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let counter = list_calls.clone();
    let mut downloader = MockDownloader::new();
    downloader.expect_list_runs().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::ProviderStatus {
                url: "https://api.github.com/repos/3Shain/dxmt/actions/runs".into(),
                status: 503,
            });
        }
        Ok(vec![])
    });
    downloader
        .expect_list_releases()
        .returning(|_| Ok(vec![release(1, "v0.1", &[])]));

    let recorded = Arc::new(AtomicBool::new(false));
    let committed = Arc::new(Notify::new());
    let mut store = MockMetadataStore::new();
    store.expect_max_run_id().returning(|| Ok(0));
    store.expect_tag_exists().returning({
        let recorded = recorded.clone();
        move |_| Ok(recorded.load(Ordering::SeqCst))
    });
    store.expect_insert_build_with_artifacts().times(1).returning({
        let recorded = recorded.clone();
        let committed = committed.clone();
        move |build, artifacts| {
            assert_eq!(build.owner().to_string(), "release v0.1");
            assert!(artifacts.is_empty());
            recorded.store(true, Ordering::SeqCst);
            committed.notify_one();
            Ok(())
        }
    });

    let engine = Arc::new(Synchroniser::new(config(), downloader, MockUploader::new(), store));
    let interval = engine.config().interval;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    // The first cycle fails on listing; the clock then advances past the
    // interval and the second cycle commits the release.
    tokio::time::timeout(interval * 3, committed.notified())
        .await
        .expect("second cycle should commit after the failed one");
    assert!(list_calls.load(Ordering::SeqCst) >= 2);
    assert!(recorded.load(Ordering::SeqCst));

    cancel.cancel();
    handle.await.unwrap();
}
