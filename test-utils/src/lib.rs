//! Test fixtures for the runtime wrapper: throwaway OCI bundles, kubelet-like
//! volume trees, and a fake runtime that records how it was called.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tempfile::TempDir;

/// Builder for a bundle directory containing `config.json` and `rootfs/`.
#[derive(Debug, Clone)]
pub struct BundleFixture {
    root_path: Option<String>,
    readonly: bool,
    mounts: Vec<Value>,
    annotations: Map<String, Value>,
    poststop: Vec<Value>,
}

impl Default for BundleFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleFixture {
    pub fn new() -> Self {
        Self {
            root_path: Some("rootfs".to_string()),
            readonly: true,
            mounts: Vec::new(),
            annotations: Map::new(),
            poststop: Vec::new(),
        }
    }

    pub fn root_path(mut self, path: impl Into<String>) -> Self {
        self.root_path = Some(path.into());
        self
    }

    pub fn without_root(mut self) -> Self {
        self.root_path = None;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn mount(mut self, source: &str, destination: &str, typ: &str) -> Self {
        self.mounts.push(json!({
            "destination": destination,
            "type": typ,
            "source": source,
            "options": ["nosuid", "noexec", "nodev"],
        }));
        self
    }

    pub fn bind(mut self, source: impl AsRef<Path>, destination: &str) -> Self {
        self.mounts.push(json!({
            "destination": destination,
            "type": "bind",
            "source": source.as_ref().to_string_lossy(),
            "options": ["rbind", "rprivate", "rw"],
        }));
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), json!(value));
        self
    }

    pub fn poststop_hook(mut self, path: &str, args: &[&str]) -> Self {
        self.poststop.push(json!({ "path": path, "args": args }));
        self
    }

    /// The spec document as containerd would write it (trimmed).
    pub fn to_json(&self) -> Value {
        let mut spec = json!({
            "ociVersion": "1.1.0",
            "process": {
                "user": { "uid": 0, "gid": 0 },
                "args": ["/bin/sh"],
                "cwd": "/"
            },
            "hostname": "fixture",
        });
        let obj = spec.as_object_mut().expect("spec literal is an object");

        if let Some(path) = &self.root_path {
            obj.insert(
                "root".into(),
                json!({ "path": path, "readonly": self.readonly }),
            );
        }
        if !self.mounts.is_empty() {
            obj.insert("mounts".into(), Value::Array(self.mounts.clone()));
        }
        if !self.annotations.is_empty() {
            obj.insert("annotations".into(), Value::Object(self.annotations.clone()));
        }
        if !self.poststop.is_empty() {
            obj.insert("hooks".into(), json!({ "poststop": self.poststop }));
        }
        spec
    }

    /// Write the bundle into a fresh temporary directory.
    pub fn write(self) -> TestBundle {
        let contents =
            serde_json::to_vec_pretty(&self.to_json()).expect("fixture spec serializes");
        self.write_bytes(&contents)
    }

    /// Write arbitrary `config.json` contents, e.g. a malformed document.
    pub fn write_raw(self, contents: &str) -> TestBundle {
        self.write_bytes(contents.as_bytes())
    }

    fn write_bytes(self, contents: &[u8]) -> TestBundle {
        let dir = TempDir::new().expect("create bundle dir");
        fs::create_dir_all(dir.path().join("rootfs")).expect("create rootfs");
        fs::write(dir.path().join("config.json"), contents).expect("write config.json");
        TestBundle { dir }
    }
}

/// A bundle on disk. Removed on drop.
#[derive(Debug)]
pub struct TestBundle {
    dir: TempDir,
}

impl TestBundle {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.json")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.path().join("rootfs")
    }

    pub fn read_config(&self) -> Vec<u8> {
        fs::read(self.config_path()).expect("read config.json")
    }

    pub fn read_json(&self) -> Value {
        serde_json::from_slice(&self.read_config()).expect("config.json is valid JSON")
    }
}

/// A kubelet-shaped pods tree with one PVC mount directory.
#[derive(Debug)]
pub struct VolumeFixture {
    base: TempDir,
    prefix: PathBuf,
    volume: PathBuf,
}

impl Default for VolumeFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeFixture {
    pub fn new() -> Self {
        let base = TempDir::new().expect("create volume base");
        let prefix = base.path().join("pods");
        let volume = prefix
            .join("5f0c2a8e-pod-uid")
            .join("volumes")
            .join("kubernetes.io~csi")
            .join("pvc-1")
            .join("mount");
        fs::create_dir_all(&volume).expect("create volume dir");
        Self {
            base,
            prefix,
            volume,
        }
    }

    /// Stand-in for `/var/lib/kubelet/pods`.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The PVC host path under the prefix.
    pub fn volume(&self) -> &Path {
        &self.volume
    }

    /// A directory next to the prefix, i.e. outside it.
    pub fn outside_dir(&self, name: &str) -> PathBuf {
        let dir = self.base.path().join(name);
        fs::create_dir_all(&dir).expect("create outside dir");
        dir
    }
}

/// Shell script standing in for runc. Records its arguments, one per line,
/// and exits with a fixed code.
#[derive(Debug)]
pub struct FakeRuntime {
    dir: TempDir,
    path: PathBuf,
    record: PathBuf,
}

impl FakeRuntime {
    pub fn new(exit_code: i32) -> Self {
        Self::named("runc", exit_code)
    }

    pub fn named(name: &str, exit_code: i32) -> Self {
        let dir = TempDir::new().expect("create fake runtime dir");
        let path = dir.path().join(name);
        let record = dir.path().join("args.txt");
        let script = format!(
            "#!/bin/sh\n: > '{record}'\nfor a in \"$@\"; do printf '%s\\n' \"$a\" >> '{record}'; done\nexit {exit_code}\n",
            record = record.display(),
        );
        fs::write(&path, script).expect("write fake runtime");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake runtime");
        Self { dir, path, record }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Arguments of the last run, or `None` if it never ran.
    pub fn recorded_args(&self) -> Option<Vec<String>> {
        let contents = fs::read_to_string(&self.record).ok()?;
        Some(contents.lines().map(str::to_string).collect())
    }
}
