//! Router config file watcher.
//!
//! # Responsibilities
//! - Reload the file on change and validate it before anything sees it
//! - Diff it against the last accepted config, section by section
//! - Hand the router only reloads that change something
//!
//! Editors often fire several events per save; the diff turns the
//! duplicates into no-ops.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::RouterConfig;

/// A validated config together with the sections that differ from the
/// one it replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigReload {
    pub config: RouterConfig,
    pub default_policy_changed: bool,
    /// Bizs whose own policy entry was added, removed or edited.
    pub changed_policies: Vec<String>,
    pub misc_changed: bool,
    pub topology_changed: bool,
    pub observability_changed: bool,
}

impl ConfigReload {
    /// Treat every section as changed.
    pub fn full(config: RouterConfig) -> Self {
        let changed_policies = config.policies.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        Self {
            config,
            default_policy_changed: true,
            changed_policies,
            misc_changed: true,
            topology_changed: true,
            observability_changed: true,
        }
    }

    /// Sections of `next` that differ from `previous`; `None` when nothing does.
    pub fn between(previous: &RouterConfig, next: &RouterConfig) -> Option<Self> {
        let changed_policies: Vec<String> = previous
            .policies
            .keys()
            .chain(next.policies.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|biz| previous.policies.get(*biz) != next.policies.get(*biz))
            .cloned()
            .collect();
        let reload = Self {
            config: next.clone(),
            default_policy_changed: previous.default_policy != next.default_policy,
            changed_policies,
            misc_changed: previous.misc != next.misc,
            topology_changed: previous.topology != next.topology,
            observability_changed: previous.observability != next.observability,
        };
        reload.is_change().then_some(reload)
    }

    pub fn policies_changed(&self) -> bool {
        self.default_policy_changed || !self.changed_policies.is_empty()
    }

    fn is_change(&self) -> bool {
        self.policies_changed() || self.misc_changed || self.topology_changed || self.observability_changed
    }
}

/// Watches one config file and emits `ConfigReload`s.
pub struct ConfigWatcher {
    path: PathBuf,
    accepted: Arc<Mutex<RouterConfig>>,
    reload_tx: mpsc::UnboundedSender<ConfigReload>,
}

impl ConfigWatcher {
    /// `current` is the config the router was built from.
    pub fn new(path: &Path, current: RouterConfig) -> (Self, mpsc::UnboundedReceiver<ConfigReload>) {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                accepted: Arc::new(Mutex::new(current)),
                reload_tx,
            },
            reload_rx,
        )
    }

    /// Load the file once and send the difference, if any.
    ///
    /// Returns whether a reload was sent.
    pub fn reload_now(&self) -> bool {
        reload_file(&self.path, &self.accepted, &self.reload_tx)
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let accepted = self.accepted.clone();
        let tx = self.reload_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload_file(&path, &accepted, &tx);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

fn reload_file(path: &Path, accepted: &Mutex<RouterConfig>, tx: &mpsc::UnboundedSender<ConfigReload>) -> bool {
    let next = match load_config(path) {
        Ok(next) => next,
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "Rejected config change, keeping current settings");
            return false;
        }
    };

    let mut accepted = accepted.lock();
    let Some(reload) = ConfigReload::between(&accepted, &next) else {
        tracing::debug!(path = ?path, "Config file touched without changes");
        return false;
    };
    tracing::info!(
        path = ?path,
        default_policy = reload.default_policy_changed,
        policies = ?reload.changed_policies,
        misc = reload.misc_changed,
        topology = reload.topology_changed,
        "Config change detected"
    );
    if tx.send(reload).is_err() {
        tracing::debug!("Config receiver dropped, ignoring reload");
        return false;
    }
    *accepted = next;
    true
}
