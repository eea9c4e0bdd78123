//! Integration tests for artifact resolution.
//!
//! Remote repositories are served by wiremock, which also asserts how many
//! index lookups and downloads each resolution performs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kindling_bootstrap::mock::MockVerifier;
use kindling_bootstrap::resolver::{GpgVerifier, ProvenanceVerifier};
use kindling_bootstrap::{ArtifactResolver, ResolutionError, ResolveOptions, ResolverConfig};
use kindling_chart::provenance::sha256_file;
use kindling_chart::{ArtifactReference, ArtifactSource, Credentials, PackageDescriptor};
use kindling_testing::ChartFixture;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    _temp: TempDir,
    root: PathBuf,
    repository_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let repository_dir = root.join("helm").join("repository");
        let cache_dir = root.join("helm").join("cache").join("archive");
        std::fs::create_dir_all(&repository_dir).unwrap();
        Self {
            _temp: temp,
            root,
            repository_dir,
            cache_dir,
        }
    }

    fn resolver(&self, verifier: Arc<dyn ProvenanceVerifier>) -> ArtifactResolver {
        ArtifactResolver::new(
            ResolverConfig {
                repository_dir: self.repository_dir.clone(),
                cache_dir: self.cache_dir.clone(),
                http_timeout: Duration::from_secs(5),
            },
            verifier,
        )
    }

    fn register_repository(&self, name: &str, url: &str, index: &str) {
        std::fs::write(
            self.repository_dir.join("repositories.yaml"),
            format!("apiVersion: v1\nrepositories:\n  - name: {name}\n    url: {url}\n"),
        )
        .unwrap();
        let cache = self.repository_dir.join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(format!("{name}-index.yaml")), index).unwrap();
    }
}

fn index_yaml(entries: &[(&str, &str)]) -> String {
    let mut out = String::from("apiVersion: v1\nentries:\n  rafter:\n");
    for (version, url) in entries {
        out.push_str(&format!(
            "    - name: rafter\n      version: {version}\n      urls:\n        - {url}\n"
        ));
    }
    out
}

fn verify_options() -> ResolveOptions {
    ResolveOptions {
        verify: true,
        keyring: PathBuf::from("/nonexistent/pubring.gpg"),
        ..Default::default()
    }
}

fn assert_loads_as(path: &Path, name: &str) {
    let chart = PackageDescriptor::load(path).unwrap();
    assert_eq!(chart.name(), name);
}

#[tokio::test]
async fn test_existing_local_file_resolves_without_network() {
    let harness = Harness::new();
    let archive = ChartFixture::new("rafter", "0.2.0")
        .package(&harness.root)
        .unwrap();

    let resolver = harness.resolver(Arc::new(MockVerifier::accepting()));
    let resolved = resolver
        .resolve(
            &ArtifactReference::new(archive.display().to_string()),
            &ResolveOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resolved.local_path, archive);
    assert!(resolved.local_path.is_absolute());
    assert!(!resolved.verified);
    assert_eq!(resolved.source, ArtifactSource::LocalPath);
    assert!(!harness.cache_dir.exists());
}

#[tokio::test]
async fn test_local_file_is_verified_when_requested() {
    let harness = Harness::new();
    let archive = ChartFixture::new("rafter", "0.2.0")
        .package(&harness.root)
        .unwrap();
    let reference = ArtifactReference::new(archive.display().to_string());

    let verifier = Arc::new(MockVerifier::accepting());
    let resolved = harness
        .resolver(verifier.clone())
        .resolve(&reference, &verify_options())
        .await
        .unwrap();
    assert!(resolved.verified);
    assert_eq!(verifier.calls(), 1);

    let err = harness
        .resolver(Arc::new(MockVerifier::rejecting()))
        .resolve(&reference, &verify_options())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
}

#[tokio::test]
async fn test_directory_with_verify_is_unsupported() {
    let harness = Harness::new();
    let dir = ChartFixture::new("rafter", "0.2.0")
        .write_dir(&harness.root)
        .unwrap();

    let verifier = Arc::new(MockVerifier::accepting());
    let err = harness
        .resolver(verifier.clone())
        .resolve(
            &ArtifactReference::new(dir.display().to_string()),
            &verify_options(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ResolutionError::VerificationUnsupported { .. }));
    assert!(err.to_string().contains("cannot verify a directory"));
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_missing_explicit_paths_are_not_found() {
    let harness = Harness::new();
    let resolver = harness.resolver(Arc::new(MockVerifier::accepting()));

    for name in [
        harness.root.join("missing.tgz").display().to_string(),
        "./kindling-missing-chart".to_string(),
    ] {
        let err = resolver
            .resolve(&ArtifactReference::new(&name), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ResolutionError::NotFound { .. }),
            "{name}: {err}"
        );
    }
}

#[tokio::test]
async fn test_bare_name_without_repository_is_not_found() {
    let harness = Harness::new();
    let resolver = harness.resolver(Arc::new(MockVerifier::accepting()));

    let err = resolver
        .resolve(&ArtifactReference::new("pkg-a"), &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::NotFound { .. }));

    let err = resolver
        .resolve(&ArtifactReference::new("   "), &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::NotFound { .. }));
}

#[tokio::test]
async fn test_local_repository_entry_is_used() {
    let harness = Harness::new();
    let in_repo = ChartFixture::new("rafter", "0.2.0")
        .write_dir(&harness.repository_dir)
        .unwrap();

    let resolved = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(&ArtifactReference::new("rafter"), &ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(resolved.local_path, in_repo);
    assert_eq!(resolved.source, ArtifactSource::LocalRepository);
}

#[tokio::test]
async fn test_remote_reference_is_looked_up_once_and_downloaded_once() {
    let server = MockServer::start().await;
    let fixture = ChartFixture::new("rafter", "0.2.0");

    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_yaml(&[
            ("0.2.0", "rafter-0.2.0.tgz"),
            ("0.1.0", "rafter-0.1.0.tgz"),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.archive_bytes().unwrap()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let resolved = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(
            &ArtifactReference::new("rafter").with_repo_url(server.uri()),
            &ResolveOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resolved.source, ArtifactSource::Downloaded);
    assert_eq!(resolved.local_path, harness.cache_dir.join("rafter-0.2.0.tgz"));
    assert_loads_as(&resolved.local_path, "rafter");
    server.verify().await;
}

#[tokio::test]
async fn test_pinned_version_and_credentials() {
    let server = MockServer::start().await;
    let fixture = ChartFixture::new("rafter", "0.1.0");

    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_yaml(&[
            ("0.2.0", "rafter-0.2.0.tgz"),
            ("v0.1.0", "rafter-0.1.0.tgz"),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.1.0.tgz"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.archive_bytes().unwrap()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let reference = ArtifactReference::new("rafter")
        .with_version("0.1.0")
        .with_repo_url(server.uri())
        .with_credentials(Credentials::new("admin", "secret"));

    let resolved = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(&reference, &ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(resolved.local_path, harness.cache_dir.join("rafter-0.1.0.tgz"));
}

#[tokio::test]
async fn test_unknown_version_is_a_lookup_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(index_yaml(&[("0.2.0", "rafter-0.2.0.tgz")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let err = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(
            &ArtifactReference::new("rafter")
                .with_version("9.9.9")
                .with_repo_url(server.uri()),
            &ResolveOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ResolutionError::Lookup { .. }));
    assert!(!harness.cache_dir.join("rafter-9.9.9.tgz").exists());
}

#[tokio::test]
async fn test_failed_download_carries_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(index_yaml(&[("0.2.0", "rafter-0.2.0.tgz")])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let err = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(
            &ArtifactReference::new("rafter").with_repo_url(server.uri()),
            &ResolveOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ResolutionError::DownloadFailed { .. }));
    assert!(err.to_string().contains("running `helm repo update` may help"));
    assert!(!harness.cache_dir.join("rafter-0.2.0.tgz").exists());
}

#[tokio::test]
async fn test_registered_repository_uses_cached_index() {
    let server = MockServer::start().await;
    let fixture = ChartFixture::new("rafter", "0.2.0");

    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.archive_bytes().unwrap()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness.register_repository(
        "rafter-charts",
        &server.uri(),
        &index_yaml(&[("0.2.0", "rafter-0.2.0.tgz")]),
    );

    let resolved = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(
            &ArtifactReference::new("rafter-charts/rafter"),
            &ResolveOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resolved.source, ArtifactSource::Downloaded);
    assert_loads_as(&resolved.local_path, "rafter");
}

#[tokio::test]
async fn test_unregistered_repository_fails_with_hint() {
    let harness = Harness::new();
    harness.register_repository("stable", "https://charts.invalid", "apiVersion: v1\n");

    let err = harness
        .resolver(Arc::new(MockVerifier::accepting()))
        .resolve(
            &ArtifactReference::new("rafter-charts/rafter"),
            &ResolveOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ResolutionError::DownloadFailed { .. }));
    assert!(err.to_string().contains("helm repo update"));
}

#[tokio::test]
async fn test_download_with_verify_fetches_provenance() {
    let server = MockServer::start().await;
    let fixture = ChartFixture::new("rafter", "0.2.0");

    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(index_yaml(&[("0.2.0", "rafter-0.2.0.tgz")])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.archive_bytes().unwrap()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz.prov"))
        .respond_with(ResponseTemplate::new(200).set_body_string("files:\n  rafter-0.2.0.tgz: sha256:00\n"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let verifier = Arc::new(MockVerifier::accepting());
    let resolved = harness
        .resolver(verifier.clone())
        .resolve(
            &ArtifactReference::new("rafter").with_repo_url(server.uri()),
            &verify_options(),
        )
        .await
        .unwrap();

    assert!(resolved.verified);
    assert_eq!(verifier.calls(), 1);
    assert!(harness.cache_dir.join("rafter-0.2.0.tgz.prov").exists());
}

#[tokio::test]
async fn test_rejected_download_is_removed_from_cache() {
    let server = MockServer::start().await;
    let fixture = ChartFixture::new("rafter", "0.2.0");

    Mock::given(method("GET"))
        .and(path("/index.yaml"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(index_yaml(&[("0.2.0", "rafter-0.2.0.tgz")])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.archive_bytes().unwrap()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rafter-0.2.0.tgz.prov"))
        .respond_with(ResponseTemplate::new(200).set_body_string("files:\n  rafter-0.2.0.tgz: sha256:00\n"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let err = harness
        .resolver(Arc::new(MockVerifier::rejecting()))
        .resolve(
            &ArtifactReference::new("rafter").with_repo_url(server.uri()),
            &verify_options(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
    assert!(!harness.cache_dir.join("rafter-0.2.0.tgz").exists());
    assert!(!harness.cache_dir.join("rafter-0.2.0.tgz.prov").exists());
}

/// Package rafter and optionally write a provenance file next to it.
#[cfg(unix)]
fn signed_archive(harness: &Harness, provenance: Option<&dyn Fn(&str) -> String>) -> PathBuf {
    let archive = ChartFixture::new("rafter", "0.2.0")
        .package(&harness.root)
        .unwrap();
    if let Some(body) = provenance {
        let digest = sha256_file(&archive).unwrap();
        let mut prov = archive.as_os_str().to_owned();
        prov.push(".prov");
        std::fs::write(PathBuf::from(prov), body(&digest)).unwrap();
    }
    archive
}

#[cfg(unix)]
async fn verify_with_gpg(
    harness: &Harness,
    archive: &Path,
    gpg: &str,
) -> Result<kindling_chart::ResolvedArtifact, ResolutionError> {
    let verifier = GpgVerifier::new(Duration::from_secs(5)).with_binary(gpg);
    harness
        .resolver(Arc::new(verifier))
        .resolve(
            &ArtifactReference::new(archive.display().to_string()),
            &verify_options(),
        )
        .await
}

#[cfg(unix)]
#[tokio::test]
async fn test_gpg_verifier_accepts_matching_digest() {
    let harness = Harness::new();
    let archive = signed_archive(
        &harness,
        Some(&|digest: &str| format!("name: rafter\nfiles:\n  rafter-0.2.0.tgz: {digest}\n")),
    );

    let resolved = verify_with_gpg(&harness, &archive, "true").await.unwrap();
    assert!(resolved.verified);
    assert_eq!(resolved.local_path, archive);
}

#[cfg(unix)]
#[tokio::test]
async fn test_gpg_verifier_requires_provenance_file() {
    let harness = Harness::new();
    let archive = signed_archive(&harness, None);

    let err = verify_with_gpg(&harness, &archive, "true").await.unwrap_err();
    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("not found"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_gpg_verifier_rejects_unlisted_archive() {
    let harness = Harness::new();
    let archive = signed_archive(
        &harness,
        Some(&|digest: &str| format!("files:\n  minio-2.5.0.tgz: {digest}\n")),
    );

    let err = verify_with_gpg(&harness, &archive, "true").await.unwrap_err();
    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("is not listed in"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_gpg_verifier_rejects_digest_mismatch() {
    let harness = Harness::new();
    let archive = signed_archive(
        &harness,
        Some(&|_: &str| "files:\n  rafter-0.2.0.tgz: sha256:0000\n".to_string()),
    );

    let err = verify_with_gpg(&harness, &archive, "true").await.unwrap_err();
    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("digest mismatch"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_gpg_verifier_rejects_bad_signature() {
    let harness = Harness::new();
    let archive = signed_archive(
        &harness,
        Some(&|digest: &str| format!("files:\n  rafter-0.2.0.tgz: {digest}\n")),
    );

    let err = verify_with_gpg(&harness, &archive, "false").await.unwrap_err();
    assert!(matches!(err, ResolutionError::VerificationFailed { .. }));
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("signature check failed"));
}
