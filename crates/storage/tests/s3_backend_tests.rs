use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use murmur_storage::{ObjectAttributes, ObjectStore, S3Backend, S3Settings, StorageError};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioContext {
    _container: ContainerAsync<GenericImage>,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl MinioContext {
    async fn new() -> Result<Self, String> {
        let access_key = "minio-access-key".to_string();
        let secret_key = "minio-secret-key".to_string();

        let container: ContainerAsync<GenericImage> = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key.clone())
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key.clone())
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;

        let endpoint = format!("http://{host}:{port}");

        Ok(Self {
            _container: container,
            endpoint,
            access_key,
            secret_key,
        })
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), String> {
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "test",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .http_client(aws_smithy_http_client::Builder::new().build_http())
            .endpoint_url(self.endpoint.clone())
            .force_path_style(true)
            .build();

        let client = Client::from_conf(config);
        client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;
        Ok(())
    }
}

struct S3TestHarness {
    _context: MinioContext,
    backend: S3Backend,
}

impl S3TestHarness {
    async fn new(prefix: Option<String>) -> Result<Self, String> {
        let context = MinioContext::new().await?;
        let bucket = "murmur-test";
        context.create_bucket(bucket).await?;

        let backend = S3Backend::new(S3Settings {
            bucket: bucket.to_string(),
            endpoint: Some(context.endpoint.clone()),
            region: Some("us-east-1".to_string()),
            prefix,
            access_key_id: Some(context.access_key.clone()),
            secret_access_key: Some(context.secret_key.clone()),
            force_path_style: true,
            request_timeout: Some(std::time::Duration::from_secs(30)),
        })
        .await
        .map_err(|e| format!("failed to create S3 backend: {e}"))?;

        Ok(Self {
            _context: context,
            backend,
        })
    }
}

async fn harness_or_skip(prefix: Option<String>) -> Option<S3TestHarness> {
    if should_skip_s3_tests() {
        return None;
    }
    match S3TestHarness::new(prefix).await {
        Ok(harness) => Some(harness),
        Err(err) => {
            eprintln!("Skipping S3 test: {err}");
            None
        }
    }
}

#[tokio::test]
async fn test_s3_put_stat_list_delete() {
    let Some(harness) = harness_or_skip(Some("prefix".to_string())).await else {
        return;
    };
    let backend = &harness.backend;

    let attrs = ObjectAttributes::default()
        .with_content_type("audio/ogg")
        .with_entry("encrypted", "true");
    backend
        .put("audio/a", Bytes::from_static(b"a"), attrs)
        .await
        .unwrap();
    backend
        .put("audio/b", Bytes::from_static(b"bb"), ObjectAttributes::default())
        .await
        .unwrap();

    let meta = backend.stat("audio/a").await.unwrap();
    assert_eq!(meta.size, 1);
    assert_eq!(meta.content_type.as_deref(), Some("audio/ogg"));
    assert_eq!(meta.metadata.get("encrypted").map(String::as_str), Some("true"));

    assert_eq!(backend.list("audio/").await.unwrap(), vec!["audio/a", "audio/b"]);

    backend.delete("audio/a").await.unwrap();
    assert!(matches!(
        backend.delete("audio/a").await,
        Err(StorageError::NotFound(_))
    ));
    assert!(!backend.exists("audio/a").await.unwrap());
}

#[tokio::test]
async fn test_s3_multipart_stream_and_abort() {
    let Some(harness) = harness_or_skip(None).await else {
        return;
    };
    let backend = &harness.backend;

    let data = vec![7u8; 6 * 1024 * 1024];
    let split_at = 3 * 1024 * 1024;

    let mut upload = backend
        .put_stream("video/streamed", ObjectAttributes::default())
        .await
        .unwrap();
    upload
        .write(Bytes::from(data[..split_at].to_vec()))
        .await
        .unwrap();
    upload
        .write(Bytes::from(data[split_at..].to_vec()))
        .await
        .unwrap();
    assert_eq!(upload.finish().await.unwrap() as usize, data.len());
    assert_eq!(backend.stat("video/streamed").await.unwrap().size as usize, data.len());

    let mut aborted = backend
        .put_stream("video/aborted", ObjectAttributes::default())
        .await
        .unwrap();
    aborted.write(Bytes::from(vec![1u8; 1024])).await.unwrap();
    aborted.abort().await.unwrap();
    assert!(!backend.exists("video/aborted").await.unwrap());
}

#[tokio::test]
async fn test_s3_empty_stream_upload() {
    let Some(harness) = harness_or_skip(None).await else {
        return;
    };
    let backend = &harness.backend;

    let upload = backend
        .put_stream("audio/empty", ObjectAttributes::default())
        .await
        .unwrap();
    assert_eq!(upload.finish().await.unwrap(), 0);
    assert_eq!(backend.get("audio/empty").await.unwrap().len(), 0);
}
