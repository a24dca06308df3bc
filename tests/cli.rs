mod common;

use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use promptsearch::DualIndex;
use promptsearch::config::{IndexDir, IndexSettings};
use promptsearch::loader::AssetMetadata;
use promptsearch::store::EmbeddedAsset;
use rstest::*;

use common::unit;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

/// 一个包含两行的索引目录
#[fixture]
fn index_dir() -> assert_fs::TempDir {
    let tmp = assert_fs::TempDir::new().unwrap();
    let mut store = DualIndex::create(IndexSettings::default(), 4, 2, "fixture").unwrap();
    for (i, prompt) in ["a red fox", "a blue whale"].into_iter().enumerate() {
        let mut meta = AssetMetadata::new(format!("{i}.png"));
        meta.prompt = prompt.to_string();
        let x = i as f32;
        store
            .add(EmbeddedAsset {
                meta,
                image_vector: unit(&[1., x, 0., 1.]),
                prompt_vector: unit(&[1., x]),
            })
            .unwrap();
    }
    store.persist(&IndexDir::new(tmp.path().join("index"))).unwrap();
    tmp
}

#[test]
fn help() -> Result<()> {
    cargo_run!("promptsearch", "--help")
        .success()
        .stdout(predicate::str::contains("build").and(predicate::str::contains("search")));
    Ok(())
}

#[test]
fn show_missing_index() -> Result<()> {
    let tmp = assert_fs::TempDir::new()?;
    cargo_run!("promptsearch", "-d", tmp.path().join("nothing"), "show")
        .failure()
        .stderr(predicate::str::contains("索引不存在"));
    Ok(())
}

#[rstest]
fn show_manifest_and_row(index_dir: assert_fs::TempDir) -> Result<()> {
    let dir = index_dir.path().join("index");
    cargo_run!("promptsearch", "-d", &dir, "show")
        .success()
        .stdout(predicate::str::contains("\"rows\": 2").and(predicate::str::contains("fixture")));
    cargo_run!("promptsearch", "-d", &dir, "show", "1")
        .success()
        .stdout(predicate::str::contains("a blue whale"));
    cargo_run!("promptsearch", "-d", &dir, "show", "5").failure();
    Ok(())
}

#[rstest]
fn export_writes_npy(index_dir: assert_fs::TempDir) -> Result<()> {
    let dir = index_dir.path().join("index");
    let out = index_dir.path().join("out");
    cargo_run!("promptsearch", "-d", &dir, "export", "-o", &out).success();

    let image: ndarray::Array2<f32> = ndarray_npy::read_npy(out.join("image.npy"))?;
    let prompt: ndarray::Array2<f32> = ndarray_npy::read_npy(out.join("prompt.npy"))?;
    assert_eq!(image.dim(), (2, 4));
    assert_eq!(prompt.dim(), (2, 2));
    Ok(())
}

#[rstest]
fn corrupted_index_refuses_to_serve(index_dir: assert_fs::TempDir) -> Result<()> {
    let dir = index_dir.path().join("index");
    std::fs::write(dir.join("metadata.json"), "[]")?;
    cargo_run!("promptsearch", "-d", &dir, "server", "--addr", "127.0.0.1:0")
        .failure()
        .stderr(predicate::str::contains("校验和不正确"));
    Ok(())
}

#[cfg(not(feature = "clip"))]
#[test]
fn build_requires_model_backend() -> Result<()> {
    let tmp = assert_fs::TempDir::new()?;
    common::write_image(&tmp.path().join("images/a.png"), [1, 2, 3]);
    cargo_run!(
        "promptsearch",
        "-d",
        tmp.path().join("index"),
        "build",
        "--source",
        tmp.path().join("images")
    )
    .failure()
    .stderr(predicate::str::contains("clip"));
    Ok(())
}
