use std::path::{Path, PathBuf};

use gpucat_adapters::{collect_all, fixture_bundle_path, JsonBundleSource, ProviderSource};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn sample_bundles_parse_for_every_fixture_provider() {
    let root = workspace_root();
    let sources: Vec<Box<dyn ProviderSource>> = ["coreweave", "lambda", "runpod"]
        .into_iter()
        .map(|provider| {
            Box::new(JsonBundleSource::new(provider, fixture_bundle_path(&root, provider)))
                as Box<dyn ProviderSource>
        })
        .collect();

    let collected = collect_all(&sources).await.unwrap();
    assert!(collected.summaries.iter().all(|s| s.success), "{:?}", collected.summaries);

    let rows: Vec<usize> = collected.provider_results.iter().map(|r| r.rows.len()).collect();
    assert_eq!(rows, vec![3, 2, 2]);

    let lambda = &collected.provider_results[1];
    assert_eq!(lambda.version, 2);
    assert_eq!(lambda.source_hash.as_deref(), Some("lambda-sample-v2"));
}
