use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::host::{NodeHandle, SceneGraph, Visibility};
use crate::error::{UpliftError, UpliftResult};

/// What to hide in the scene while a buffer is captured.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub enum VisibilityPolicy {
    #[default]
    ShowAll,
    /// Hide the target node itself.
    HideTarget,
    /// Hide every sibling of the target.
    HideSiblings,
    /// Hide every sibling of the target except the named ones.
    HideSiblingsExcept(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPolicy {
    Name(String),
    Except { hide_siblings_except: Vec<String> },
}

impl TryFrom<RawPolicy> for VisibilityPolicy {
    type Error = String;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        match raw {
            RawPolicy::Name(name) => match name.to_ascii_lowercase().as_str() {
                "showall" | "show_all" => Ok(Self::ShowAll),
                "hideme" | "hide_target" => Ok(Self::HideTarget),
                "hideothers" | "hide_siblings" => Ok(Self::HideSiblings),
                other => Err(format!("unknown visibility policy: {other}")),
            },
            RawPolicy::Except {
                hide_siblings_except,
            } => Ok(Self::HideSiblingsExcept(hide_siblings_except)),
        }
    }
}

impl From<VisibilityPolicy> for RawPolicy {
    fn from(policy: VisibilityPolicy) -> Self {
        match policy {
            VisibilityPolicy::ShowAll => Self::Name("showall".into()),
            VisibilityPolicy::HideTarget => Self::Name("hideme".into()),
            VisibilityPolicy::HideSiblings => Self::Name("hideothers".into()),
            VisibilityPolicy::HideSiblingsExcept(keep) => Self::Except {
                hide_siblings_except: keep,
            },
        }
    }
}

/// Scoped visibility change.
///
/// Every node hidden through the guard is restored to its recorded state by
/// [`VisibilityGuard::revert`], or on drop if the guard is abandoned by an early return.
pub struct VisibilityGuard {
    scene: Arc<dyn SceneGraph>,
    saved: Vec<(NodeHandle, Visibility)>,
    reverted: bool,
}

impl VisibilityGuard {
    pub fn apply(
        scene: Arc<dyn SceneGraph>,
        target: Option<&str>,
        policy: &VisibilityPolicy,
    ) -> UpliftResult<Self> {
        let mut guard = Self {
            scene,
            saved: Vec::new(),
            reverted: false,
        };

        if *policy == VisibilityPolicy::ShowAll {
            return Ok(guard);
        }
        let Some(path) = target else {
            tracing::warn!(?policy, "visibility policy without a scene node; ignored");
            return Ok(guard);
        };
        let Some(node) = guard.scene.node(path) else {
            tracing::warn!(path, "scene node not found; capturing without visibility change");
            return Ok(guard);
        };

        let to_hide = match policy {
            VisibilityPolicy::ShowAll => Vec::new(),
            VisibilityPolicy::HideTarget => vec![node],
            VisibilityPolicy::HideSiblings => guard.siblings(&node, &[]),
            VisibilityPolicy::HideSiblingsExcept(keep) => guard.siblings(&node, keep),
        };

        for n in to_hide {
            guard.hide(n)?;
        }
        Ok(guard)
    }

    /// True when at least one node was hidden.
    pub fn mutated(&self) -> bool {
        !self.saved.is_empty()
    }

    pub fn hidden(&self) -> impl Iterator<Item = &NodeHandle> {
        self.saved.iter().map(|(n, _)| n)
    }

    /// Restore every recorded node, attempting all of them even if some fail.
    pub fn revert(mut self) -> UpliftResult<()> {
        let mut errors = self.restore_all();
        if errors.is_empty() {
            return Ok(());
        }
        let first = errors.remove(0);
        if !errors.is_empty() {
            tracing::error!(more = errors.len(), "additional visibility restores failed");
        }
        Err(UpliftError::Other(first))
    }

    fn siblings(&self, node: &NodeHandle, keep: &[String]) -> Vec<NodeHandle> {
        let Some(parent) = self.scene.parent(node) else {
            tracing::warn!(path = node.path(), "scene node has no parent; no siblings to hide");
            return Vec::new();
        };
        self.scene
            .children(&parent)
            .into_iter()
            .filter(|c| c != node && !keep.iter().any(|k| k == c.name()))
            .collect()
    }

    fn hide(&mut self, node: NodeHandle) -> UpliftResult<()> {
        let previous = self
            .scene
            .visibility(&node)
            .with_context(|| format!("read visibility of {}", node.path()))?;
        self.scene
            .set_visibility(&node, Visibility::Invisible)
            .with_context(|| format!("hide {}", node.path()))?;
        tracing::debug!(path = node.path(), "hidden for capture");
        self.saved.push((node, previous));
        Ok(())
    }

    fn restore_all(&mut self) -> Vec<anyhow::Error> {
        self.reverted = true;
        let mut errors = Vec::new();
        for (node, previous) in self.saved.drain(..).rev() {
            if let Err(e) = self
                .scene
                .set_visibility(&node, previous)
                .with_context(|| format!("restore visibility of {}", node.path()))
            {
                errors.push(e);
            }
        }
        errors
    }
}

impl Drop for VisibilityGuard {
    fn drop(&mut self) {
        if self.reverted {
            return;
        }
        for e in self.restore_all() {
            tracing::error!(error = %format!("{e:#}"), "visibility restore failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_accepts_legacy_and_structured_forms() {
        let p: VisibilityPolicy = serde_json::from_str("\"hideme\"").unwrap();
        assert_eq!(p, VisibilityPolicy::HideTarget);
        let p: VisibilityPolicy = serde_json::from_str("\"hide_siblings\"").unwrap();
        assert_eq!(p, VisibilityPolicy::HideSiblings);
        let p: VisibilityPolicy =
            serde_json::from_str(r#"{"hide_siblings_except": ["Floor"]}"#).unwrap();
        assert_eq!(p, VisibilityPolicy::HideSiblingsExcept(vec!["Floor".into()]));
        assert!(serde_json::from_str::<VisibilityPolicy>("\"hide_everything\"").is_err());
    }
}
