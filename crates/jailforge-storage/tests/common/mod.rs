//! An in-memory stand-in for the `zfs` command.
//!
//! Datasets get a real mountpoint inside a temporary directory so populate
//! callbacks can write files. Snapshots, clones and origins are tracked in
//! memory; no data is copied between datasets.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use jailforge_common::exec::CommandLine;
use jailforge_common::FakeExecutor;
use jailforge_storage::Zfs;
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Debug, Default)]
pub struct State {
    /// dataset -> origin snapshot, if cloned
    pub datasets: BTreeMap<String, Option<String>>,
    pub snapshots: BTreeSet<String>,
    /// Command prefixes that fail with status 1.
    pub failing: Vec<String>,
    /// Report returned for any rsync invocation.
    pub rsync_report: String,
}

pub struct FakeZfs {
    pub state: Arc<Mutex<State>>,
    pub executor: Arc<FakeExecutor>,
    mounts: Arc<TempDir>,
}

impl FakeZfs {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let mounts = Arc::new(tempfile::tempdir().unwrap());
        let executor = FakeExecutor::new();

        let handler_state = Arc::clone(&state);
        let handler_mounts = Arc::clone(&mounts);
        executor.set_handler(Box::new(move |line| {
            handle(&mut handler_state.lock(), handler_mounts.path(), line)
        }));

        Self {
            state,
            executor,
            mounts,
        }
    }

    pub fn zfs(&self) -> Zfs {
        Zfs::new(self.executor.clone().as_executor())
    }

    /// Create a dataset directly, bypassing the command log.
    pub fn seed(&self, dataset: &str) -> PathBuf {
        self.state.lock().datasets.insert(dataset.to_string(), None);
        let path = mountpoint(self.mounts.path(), dataset);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn has(&self, dataset: &str) -> bool {
        let state = self.state.lock();
        state.datasets.contains_key(dataset) || state.snapshots.contains(dataset)
    }

    pub fn fail(&self, prefix: &str) {
        self.state.lock().failing.push(prefix.to_string());
    }

    pub fn set_rsync_report(&self, report: &str) {
        self.state.lock().rsync_report = report.to_string();
    }

    pub fn mountpoint(&self, dataset: &str) -> PathBuf {
        mountpoint(self.mounts.path(), dataset)
    }

    /// Rendered command lines, without the read-only probes.
    pub fn mutations(&self) -> Vec<String> {
        self.executor
            .command_strings()
            .into_iter()
            .filter(|c| !c.starts_with("zfs list") && !c.starts_with("zfs get"))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.executor
            .command_strings()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn mountpoint(root: &Path, dataset: &str) -> PathBuf {
    root.join(dataset.replace('/', "_"))
}

fn ok(stdout: &str) -> Output {
    FakeExecutor::success(stdout)
}

fn fail(stderr: &str) -> Output {
    FakeExecutor::failure(1, stderr)
}

/// The last `n` arguments, where zfs puts its operands.
fn operands(args: &[String], n: usize) -> Vec<&str> {
    args[args.len().saturating_sub(n)..]
        .iter()
        .map(String::as_str)
        .collect()
}

fn handle(state: &mut State, root: &Path, line: &CommandLine) -> Output {
    let rendered = line.to_string();
    if state.failing.iter().any(|p| rendered.starts_with(p)) {
        return fail("injected failure");
    }
    if line.program == "rsync" {
        return ok(&state.rsync_report);
    }
    if line.program != "zfs" {
        return ok("");
    }

    let Some((verb, rest)) = line.args.split_first() else {
        return FakeExecutor::failure(2, "usage");
    };

    match verb.as_str() {
        "create" => {
            let name = operands(rest, 1)[0].to_string();
            if state.datasets.contains_key(&name) {
                return fail("dataset already exists");
            }
            std::fs::create_dir_all(mountpoint(root, &name)).unwrap();
            state.datasets.insert(name, None);
            ok("")
        }
        "snapshot" => {
            let snapshot = operands(rest, 1)[0].to_string();
            let Some((dataset, _)) = snapshot.split_once('@') else {
                return FakeExecutor::failure(2, "invalid snapshot name");
            };
            if !state.datasets.contains_key(dataset) {
                return FakeExecutor::failure(2, "dataset does not exist");
            }
            if !state.snapshots.insert(snapshot.clone()) {
                return fail("snapshot already exists");
            }
            ok("")
        }
        "clone" => {
            let args = operands(rest, 2);
            let (snapshot, target) = (args[0].to_string(), args[1].to_string());
            if !state.snapshots.contains(&snapshot) {
                return fail("snapshot does not exist");
            }
            if state.datasets.contains_key(&target) {
                return fail("dataset already exists");
            }
            std::fs::create_dir_all(mountpoint(root, &target)).unwrap();
            state.datasets.insert(target, Some(snapshot));
            ok("")
        }
        "destroy" => {
            let name = operands(rest, 1)[0].to_string();
            if name.contains('@') {
                if !state.snapshots.remove(&name) {
                    return fail("could not find any snapshots to destroy");
                }
                destroy_dependents(state, root, &name);
                return ok("");
            }
            if !state.datasets.contains_key(&name) {
                return fail("dataset does not exist");
            }
            destroy_dataset(state, root, &name);
            ok("")
        }
        "get" => {
            let args = operands(rest, 2);
            let (property, name) = (args[0], args[1]);
            let Some(origin) = state.datasets.get(name) else {
                return fail("dataset does not exist");
            };
            match property {
                "mountpoint" => ok(&format!("{}\n", mountpoint(root, name).display())),
                "origin" => ok(&format!("{}\n", origin.as_deref().unwrap_or("-"))),
                _ => ok("-\n"),
            }
        }
        // `zfs list -o name -H <name>` is the existence probe.
        "list" => match rest {
            [o, _, h, name] if o == "-o" && h == "-H" => {
                if state.datasets.contains_key(name) || state.snapshots.contains(name) {
                    ok(&format!("{name}\n"))
                } else {
                    fail("dataset does not exist")
                }
            }
            _ => {
                let names: Vec<&str> = state.datasets.keys().map(String::as_str).collect();
                ok(&(names.join("\n") + "\n"))
            }
        },
        "rollback" | "promote" | "set" => ok(""),
        _ => FakeExecutor::failure(2, "unrecognized command"),
    }
}

fn destroy_dataset(state: &mut State, root: &Path, name: &str) {
    let prefix = format!("{name}@");
    let snapshots: Vec<String> = state
        .snapshots
        .iter()
        .filter(|s| s.starts_with(&prefix))
        .cloned()
        .collect();
    for snapshot in snapshots {
        state.snapshots.remove(&snapshot);
        destroy_dependents(state, root, &snapshot);
    }

    let children = format!("{name}/");
    let nested: Vec<String> = state
        .datasets
        .keys()
        .filter(|d| d.starts_with(&children))
        .cloned()
        .collect();
    for child in nested {
        destroy_dataset(state, root, &child);
    }

    state.datasets.remove(name);
    let _ = std::fs::remove_dir_all(mountpoint(root, name));
}

fn destroy_dependents(state: &mut State, root: &Path, snapshot: &str) {
    let clones: Vec<String> = state
        .datasets
        .iter()
        .filter(|(_, origin)| origin.as_deref() == Some(snapshot))
        .map(|(name, _)| name.clone())
        .collect();
    for clone in clones {
        destroy_dataset(state, root, &clone);
    }
}
