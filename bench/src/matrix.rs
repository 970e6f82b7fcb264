//! Quest resolution and matrix expansion.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use quest_runner::config::AgentConfig;

/// One cell of the benchmark matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub quest: PathBuf,
    pub agent: AgentConfig,
}

impl Pair {
    /// Short display label for progress reporting.
    pub fn label(&self) -> String {
        let quest = self
            .quest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.quest.display().to_string());
        format!("{}/{}", self.agent.agent_id, quest)
    }
}

/// Resolve quest inputs to concrete `.qm` files.
///
/// Files are taken as-is; directories expand to every `.qm` beneath them.
/// The result is in stable lexicographic order with duplicates removed.
pub fn resolve_quests(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            collect_qm_files(input, &mut files)
                .with_context(|| format!("scan {}", input.display()))?;
        } else {
            bail!("quest path {} does not exist", input.display());
        }
    }
    files.sort();
    files.dedup();
    if files.is_empty() {
        bail!("no quest files resolved");
    }
    Ok(files)
}

fn collect_qm_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        if path.is_dir() {
            collect_qm_files(&path, files)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("qm") {
            files.push(path);
        }
    }
    Ok(())
}

/// Cartesian product quests × agents, quest-major.
pub fn expand_pairs(quests: &[PathBuf], agents: &[AgentConfig]) -> Vec<Pair> {
    let mut pairs = Vec::with_capacity(quests.len() * agents.len());
    for quest in quests {
        for agent in agents {
            pairs.push(Pair {
                quest: quest.clone(),
                agent: agent.clone(),
            });
        }
    }
    pairs
}
