//! A fake FreeBSD host: `zfs`, `zpool`, `jail` and `jls` are interpreted in
//! memory, every other command succeeds.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use jailforge::Provisioner;
use jailforge::registry::JailRegistry;
use jailforge_common::exec::CommandLine;
use jailforge_common::{FakeExecutor, ForgeConfig};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const POOL: &str = "zroot";
pub const IMAGES: &str = "zroot/jailforge/images";
pub const CONTAINERS: &str = "zroot/jailforge/containers";
pub const VOLUMES: &str = "zroot/jailforge/volumes";
pub const JID: u32 = 7;

#[derive(Debug, Default)]
pub struct State {
    pub datasets: BTreeMap<String, Option<String>>,
    pub snapshots: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub failing: Vec<String>,
    pub address: Option<String>,
}

pub struct FakeHost {
    pub state: Arc<Mutex<State>>,
    pub executor: Arc<FakeExecutor>,
    pub registry: Arc<JailRegistry>,
    dir: Arc<TempDir>,
}

impl FakeHost {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State {
            address: Some("10.0.0.2".to_string()),
            ..State::default()
        }));
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let executor = FakeExecutor::new();

        let handler_state = Arc::clone(&state);
        let handler_dir = Arc::clone(&dir);
        executor.set_handler(Box::new(move |line| {
            handle(&mut handler_state.lock(), &mounts(handler_dir.path()), line)
        }));

        let host = Self {
            state,
            executor,
            registry: JailRegistry::new(),
            dir,
        };
        std::fs::create_dir_all(mounts(host.dir.path())).unwrap();
        std::fs::write(host.resolv(), "nameserver 192.0.2.53\n").unwrap();
        std::fs::write(host.hosts_file(), "127.0.0.1 localhost\n").unwrap();
        host
    }

    pub fn config(&self) -> ForgeConfig {
        ForgeConfig {
            pool: POOL.to_string(),
            hosts_file: self.hosts_file(),
            command_timeout: 0,
            ..ForgeConfig::default()
        }
        .with_root(self.dir.path().join("data"))
    }

    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            self.config(),
            Arc::clone(&self.executor).as_executor(),
            Arc::clone(&self.registry),
        )
        .with_resolv(Some(self.resolv()))
        .with_host_cpus(4)
    }

    /// Create a base image dataset with a minimal tree.
    pub fn seed_base(&self, name: &str) {
        let dataset = format!("{IMAGES}/{name}");
        let mut state = self.state.lock();
        for d in ["zroot", "zroot/jailforge", IMAGES, dataset.as_str()] {
            state.datasets.insert(d.to_string(), None);
        }
        state.snapshots.insert(format!("{dataset}@first"));
        let root = self.mountpoint(&dataset);
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/rc.conf"), "sshd_enable=\"YES\"\n").unwrap();
    }

    pub fn fail(&self, prefix: &str) {
        self.state.lock().failing.push(prefix.to_string());
    }

    pub fn set_address(&self, address: Option<&str>) {
        self.state.lock().address = address.map(str::to_string);
    }

    pub fn has(&self, dataset: &str) -> bool {
        self.state.lock().datasets.contains_key(dataset)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().running.contains(name)
    }

    pub fn mountpoint(&self, dataset: &str) -> PathBuf {
        mountpoint(&mounts(self.dir.path()), dataset)
    }

    pub fn resolv(&self) -> PathBuf {
        self.dir.path().join("resolv.conf")
    }

    pub fn hosts_file(&self) -> PathBuf {
        self.dir.path().join("hosts")
    }

    /// Rendered command lines, without read-only probes.
    pub fn mutations(&self) -> Vec<String> {
        self.executor
            .command_strings()
            .into_iter()
            .filter(|c| {
                !c.starts_with("zfs list")
                    && !c.starts_with("zfs get")
                    && !c.starts_with("zpool")
                    && !c.starts_with("jls")
            })
            .collect()
    }

    /// Index of the first mutation starting with `prefix`.
    pub fn position(&self, prefix: &str) -> usize {
        self.mutations()
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("no command starting with {prefix:?} in {:#?}", self.mutations()))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.executor
            .command_strings()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn mounts(dir: &Path) -> PathBuf {
    dir.join("mnt")
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

    match line.program.as_str() {
        "zpool" => ok(&format!("{POOL}\n")),
        "zfs" => zfs(state, root, &line.args),
        "jail" => {
            let name = operands(&line.args, 1)[0].to_string();
            if line.args.first().map(String::as_str) == Some("-c") {
                state.running.insert(name);
                ok("")
            } else if state.running.remove(&name) {
                ok("")
            } else {
                fail("jail not found")
            }
        }
        "jls" => {
            let name = &line.args[1];
            if !state.running.contains(name) {
                return fail("jls: jail not found");
            }
            let ip = state
                .address
                .as_ref()
                .map_or_else(String::new, |a| format!(", \"ip4.addr\": [\"{a}\"]"));
            ok(&format!(
                "{{\"jail-information\": {{\"jail\": [{{\"jid\": {JID}, \"name\": \"{name}\", \
                 \"host.hostname\": \"{name}\"{ip}}}]}}}}"
            ))
        }
        _ => ok(""),
    }
}

fn zfs(state: &mut State, root: &Path, args: &[String]) -> Output {
    let Some((verb, rest)) = args.split_first() else {
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
            if !state.snapshots.contains(&snapshot) || state.datasets.contains_key(&target) {
                return fail("cannot clone");
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
        _ => ok(""),
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
