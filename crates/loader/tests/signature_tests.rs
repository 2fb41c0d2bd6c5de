mod common;

use common::{ManifestBuilder, TestEnv, can_bind_localhost};
use httpmock::Method::GET;
use serde_json::json;
use std::sync::Arc;
use updraft_core::manifest::UNSIGNED_SIGNATURE;
use updraft_loader::{LoaderError, RemoteLoadOutcome, RemoteLoader};
use updraft_metadata::UpdateRepo;
use updraft_signer::{ManifestSigner, SignatureVerifier, StaticKeySource};

fn envelope_body(signer: &ManifestSigner, manifest: &ManifestBuilder) -> serde_json::Value {
    let envelope = signer.envelope(manifest.build().to_string());
    serde_json::to_value(envelope).expect("envelope json")
}

#[tokio::test]
async fn test_signed_manifest_verifies_with_fetched_key() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return Ok(());
    }
    let signer = ManifestSigner::generate();
    let mut env = TestEnv::new().await?;
    let key_url = env.server.url("/keys/manifest.pub").parse::<url::Url>()?;
    env.reconfigure(|config| {
        config.expects_signed_manifest = true;
        config.public_key_url = Some(key_url);
    });

    let manifest = ManifestBuilder::new("2024-05-01T00:00:00Z").remote_asset(
        "bundle.js",
        &env.asset_url("bundle.js"),
        b"bundle",
        true,
    );
    let key = env
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/keys/manifest.pub");
            then.status(200).body(signer.public_key().to_base64());
        })
        .await;
    env.server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/manifest")
                .header("updraft-accept-signature", "true");
            then.status(200).json_body(envelope_body(&signer, &manifest));
        })
        .await;
    env.server
        .mock_async(|when, then| {
            when.method(GET).path("/assets/bundle.js");
            then.status(200).body("bundle");
        })
        .await;

    let outcome = RemoteLoader::new(env.ctx.clone(), env.downloader())
        .start(|_| true, None)
        .await?;
    let RemoteLoadOutcome::Loaded(outcome) = outcome else {
        panic!("expected a loaded update");
    };
    assert!(outcome.is_ready());
    assert_eq!(key.hits_async().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_tampered_signature_is_rejected_without_persisting() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let signer = ManifestSigner::generate();
    let mut env = TestEnv::new().await?;
    let key_url = env.server.url("/keys/manifest.pub").parse::<url::Url>()?;
    env.reconfigure(|config| {
        config.expects_signed_manifest = true;
        config.public_key_url = Some(key_url);
    });

    let manifest = ManifestBuilder::new("2024-05-01T00:00:00Z").remote_asset(
        "bundle.js",
        &env.asset_url("bundle.js"),
        b"bundle",
        true,
    );
    let forged = ManifestBuilder::new("2024-05-02T00:00:00Z").remote_asset(
        "evil.js",
        &env.asset_url("evil.js"),
        b"evil",
        true,
    );
    let key = env
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/keys/manifest.pub");
            then.status(200).body(signer.public_key().to_base64());
        })
        .await;
    env.server
        .mock_async(|when, then| {
            when.method(GET).path("/manifest");
            then.status(200).json_body(json!({
                "manifestString": forged.build().to_string(),
                "signature": signer.sign(&manifest.build().to_string()),
            }));
        })
        .await;

    let err = RemoteLoader::new(env.ctx.clone(), env.downloader())
        .start(|_| true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoaderError::Verification(_)), "{err}");
    // Cached key first, then one refetch bypassing the cache.
    assert_eq!(key.hits_async().await, 2);
    assert!(env.metadata.all_updates().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_plain_manifest_rejected_when_signing_expected() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let signer = ManifestSigner::generate();
    let env = TestEnv::with_config(|config| config.expects_signed_manifest = true).await?;
    let downloader = env
        .downloader()
        .with_verifier(SignatureVerifier::new(Arc::new(StaticKeySource::new(
            signer.public_key().clone(),
        ))));
    let manifest = ManifestBuilder::new("2024-05-01T00:00:00Z").remote_asset(
        "bundle.js",
        &env.asset_url("bundle.js"),
        b"bundle",
        true,
    );
    env.server
        .mock_async(|when, then| {
            when.method(GET).path("/manifest");
            then.status(200).json_body(manifest.build());
        })
        .await;

    let err = RemoteLoader::new(env.ctx.clone(), downloader)
        .start(|_| true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LoaderError::Verification(_)), "{err}");
    assert!(env.metadata.all_updates().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unsigned_envelope_accepted_when_signing_optional() -> anyhow::Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let env = TestEnv::new().await?;
    let manifest = ManifestBuilder::new("2024-05-01T00:00:00Z").remote_asset(
        "bundle.js",
        &env.asset_url("bundle.js"),
        b"bundle",
        true,
    );
    env.server
        .mock_async(|when, then| {
            when.method(GET).path("/manifest");
            then.status(200).json_body(json!({
                "manifestString": manifest.build().to_string(),
                "signature": UNSIGNED_SIGNATURE,
            }));
        })
        .await;
    env.server
        .mock_async(|when, then| {
            when.method(GET).path("/assets/bundle.js");
            then.status(200).body("bundle");
        })
        .await;

    let outcome = RemoteLoader::new(env.ctx.clone(), env.downloader())
        .start(|_| true, None)
        .await?;
    let RemoteLoadOutcome::Loaded(outcome) = outcome else {
        panic!("expected a loaded update");
    };
    assert_eq!(outcome.update.id, manifest.id());
    assert!(outcome.is_ready());
    Ok(())
}
