use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PROMPT: &str = "";
pub const DEFAULT_GUIDANCE: f32 = 7.5;
pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_SAMPLER: &str = "unknown";

const PROMPT_KEYS: &[&str] = &["p", "prompt"];
const SEED_KEYS: &[&str] = &["se", "seed"];
const GUIDANCE_KEYS: &[&str] = &["c", "cfg", "guidance", "guidance_scale"];
const STEPS_KEYS: &[&str] = &["st", "steps", "num_inference_steps"];
const SAMPLER_KEYS: &[&str] = &["sa", "sampler", "scheduler"];

/// 一张图片的生成参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub id: String,
    pub prompt: String,
    pub seed: Option<i64>,
    pub guidance: f32,
    pub steps: u32,
    pub sampler: String,
    /// 未识别的字段，以及无法解析的已知字段的原始值
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl AssetMetadata {
    /// 没有元数据时使用的默认值
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: DEFAULT_PROMPT.to_string(),
            seed: None,
            guidance: DEFAULT_GUIDANCE,
            steps: DEFAULT_STEPS,
            sampler: DEFAULT_SAMPLER.to_string(),
            extra: BTreeMap::new(),
        }
    }

    /// 从元数据片段中解析，同一字段的多个别名按顺序取第一个出现的
    pub fn from_fragment(id: impl Into<String>, fragment: &Map<String, Value>) -> Self {
        let mut meta = Self::new(id);
        let mut rest = fragment.clone();

        if let Some(v) = take(&mut rest, PROMPT_KEYS, |v| v.as_str().map(str::to_string)) {
            meta.prompt = v;
        }
        if let Some(v) = take(&mut rest, SEED_KEYS, parse_seed) {
            meta.seed = v;
        }
        if let Some(v) = take(&mut rest, GUIDANCE_KEYS, parse_guidance) {
            meta.guidance = v;
        }
        if let Some(v) = take(&mut rest, STEPS_KEYS, parse_steps) {
            meta.steps = v;
        }
        if let Some(v) = take(&mut rest, SAMPLER_KEYS, |v| v.as_str().map(str::to_string)) {
            meta.sampler = v;
        }

        meta.extra = rest.into_iter().collect();
        meta
    }
}

/// 找到第一个出现的别名并解析，解析成功才从 rest 中移除
fn take<T>(
    rest: &mut Map<String, Value>,
    keys: &[&str],
    parse: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    let key = keys.iter().find(|k| rest.contains_key(**k))?;
    let value = parse(&rest[*key])?;
    rest.remove(*key);
    Some(value)
}

fn parse_seed(v: &Value) -> Option<Option<i64>> {
    match v {
        Value::Null => Some(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0. && f.abs() < 9.2e18).map(|f| f as i64))
            .map(Some),
        Value::String(s) => s.trim().parse().ok().map(Some),
        _ => None,
    }
}

fn parse_guidance(v: &Value) -> Option<f32> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f as f32)
}

fn parse_steps(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => match n.as_u64() {
            Some(u) => u32::try_from(u).ok(),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0. && *f >= 0. && *f <= u32::MAX as f64)
                .map(|f| f as u32),
        },
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 同一 ID 在多个文件中出现时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// 保留先加载的
    #[default]
    FirstWins,
    /// 用后加载的覆盖
    LastWins,
}

/// 与图片分开存放的元数据，格式为 `{ "<id>": { ... } }`
#[derive(Debug, Default)]
pub struct SideChannel {
    entries: BTreeMap<String, Map<String, Value>>,
    duplicates: usize,
    policy: MergePolicy,
}

impl SideChannel {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy, ..Default::default() }
    }

    /// 加载若干文件或目录，目录中的 `*.json` 按文件名排序后加载
    pub fn load(paths: &[PathBuf], policy: MergePolicy) -> Result<Self> {
        let mut side = Self::new(policy);
        for path in expand_paths(paths)? {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("无法读取元数据文件 {}", path.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("无法解析元数据文件 {}", path.display()))?;
            let before = side.len();
            side.merge(&path.display().to_string(), value)?;
            info!("加载元数据 {}: 新增 {} 条", path.display(), side.len() - before);
        }
        if side.duplicates > 0 {
            warn!("元数据中共有 {} 个重复 ID", side.duplicates);
        }
        Ok(side)
    }

    /// 合并一个元数据对象
    pub fn merge(&mut self, source: &str, value: Value) -> Result<()> {
        let Value::Object(map) = value else {
            bail!("{source}: 元数据顶层必须是对象");
        };
        for (id, fragment) in map {
            let Value::Object(fragment) = fragment else {
                warn!("{source}: {id} 的元数据不是对象，已忽略");
                continue;
            };
            match self.entries.get_mut(&id) {
                Some(existing) => {
                    self.duplicates += 1;
                    match self.policy {
                        MergePolicy::FirstWins => {
                            warn!("{source}: 重复的 ID {id}，保留先加载的元数据");
                        }
                        MergePolicy::LastWins => {
                            warn!("{source}: 重复的 ID {id}，覆盖已有的元数据");
                            *existing = fragment;
                        }
                    }
                }
                None => {
                    self.entries.insert(id, fragment);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Map<String, Value>> {
        self.entries.get(id)
    }

    /// 某个 ID 的元数据，缺失时使用默认值
    pub fn metadata_for(&self, id: &str) -> AssetMetadata {
        match self.get(id) {
            Some(fragment) => AssetMetadata::from_fragment(id, fragment),
            None => AssetMetadata::new(id),
        }
    }

    /// 所有 ID，已排序
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for path in paths {
        if path.is_dir() {
            let mut entries = std::fs::read_dir(path)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_json(p))
                .collect::<Vec<_>>();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
