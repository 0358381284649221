//! Fake Dobby installation for integration tests.
//!
//! Shell scripts stand in for the daemon, the control tool, the bundle
//! generator and the memcr helper. Container state lives in plain files under
//! the temp directory, so a whole test group runs without containers.

#![allow(dead_code)]

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use dobby_l2_harness::{HarnessConfig, Platform, Timings, Verbosity};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;

/// Payload marker that keeps a fake container running after `start`.
pub const LONG_RUNNING: &str = "LONG_RUNNING";

/// Scripts are written then executed; serializing the tests in one binary
/// keeps a concurrent fork from holding a script open for writing (ETXTBSY).
static SERIAL: Mutex<()> = Mutex::new(());

const DAEMON: &str = r#"#!/bin/sh
STATE='@STATE@'
if [ -f "$STATE/fault.startup_segv" ]; then
    kill -SEGV $$
fi
if [ -f "$STATE/fault.startup_exit" ]; then
    echo "invalid settings file" >&2
    exit 3
fi
: > "$STATE/daemon.up"
echo "started Dobby daemon" >&2
stop() {
    rm -f "$STATE/daemon.up"
    echo "stopped Dobby daemon" >&2
    if [ -f "$STATE/fault.segv" ]; then
        trap - SEGV
        kill -SEGV $$
    fi
    exit 0
}
trap stop TERM INT
while :; do sleep 0.05; done
"#;

const TOOL: &str = r#"#!/bin/sh
STATE='@STATE@'
LOGS='@LOGS@'
DUMP='@DUMP@'
CGROUP='@CGROUP@'
[ "$1" = "-v" ] && shift
verb="$1"
id="$2"
f="$STATE/$id"
if [ ! -f "$STATE/daemon.up" ]; then
    echo "failed to connect to daemon" >&2
    exit 1
fi
case "$verb" in
start)
    path="$3"
    if [ -d "$path" ]; then payload="$path/payload"; else payload="$path"; fi
    if [ ! -f "$payload" ]; then
        echo "failed to start container '$id'" >&2
        exit 1
    fi
    cp "$payload" "$LOGS/$id.log"
    limit=256
    if [ -f "$path/pids.limit" ]; then limit=$(cat "$path/pids.limit"); fi
    mkdir -p "$CGROUP/$id"
    echo "$limit" > "$CGROUP/$id/pids.max"
    if grep -q DOBBY_TEST "$payload"; then
        cp "$payload" "$STATE/net.msg"
    fi
    if grep -q LONG_RUNNING "$payload"; then
        echo running > "$f.state"
        echo "1001, 1002" > "$f.pids"
        : > "$f.annotations"
    fi
    echo "started '$id' container"
    ;;
info)
    if [ -f "$f.state" ]; then
        printf '{ "state" : "%s", "pids" : [ %s ], "annotations" : { %s } }\n' \
            "$(cat "$f.state")" "$(cat "$f.pids")" "$(cat "$f.annotations")"
    else
        echo "failed to find container '$id'"
    fi
    ;;
pause)
    echo paused > "$f.state"
    echo "paused container '$id'"
    ;;
resume)
    echo running > "$f.state"
    echo "resumed container '$id'"
    ;;
hibernate)
    if [ ! -f "$STATE/fault.hibernate_state" ]; then
        echo hibernated > "$f.state"
    fi
    if [ ! -f "$STATE/fault.hibernate" ]; then
        for pid in $(tr -d ',' < "$f.pids"); do : > "$DUMP/pages-$pid.img"; done
    fi
    echo "hibernated container '$id'"
    ;;
wakeup)
    if [ ! -f "$STATE/fault.wakeup" ]; then
        if [ ! -f "$STATE/fault.restore" ]; then
            for pid in $(tr -d ',' < "$f.pids"); do rm -f "$DUMP/pages-$pid.img"; done
        fi
        echo running > "$f.state"
        if [ -f "$STATE/fault.pids" ]; then
            echo "2001, 2002" > "$f.pids"
        fi
    fi
    echo "woke up container '$id'"
    ;;
annotate)
    printf '"%s" : "%s"' "$3" "$4" > "$f.annotations"
    echo "annotate successful for container '$id'"
    ;;
remove-annotation)
    : > "$f.annotations"
    echo "removed $3 key from container '$id'"
    ;;
stop)
    rm -f "$f.state" "$f.pids" "$f.annotations"
    echo "stopped container '$id'"
    ;;
*)
    echo "unknown command $verb" >&2
    exit 1
    ;;
esac
"#;

const GENERATOR: &str = r#"#!/bin/sh
echo "Dobby Bundle Generator Tool"
mkdir -p "$4" && cp "$2" "$4/payload"
"#;

const HELPER: &str = r#"#!/bin/sh
STATE='@STATE@'
trap ': > "$STATE/helper.interrupted"; exit 0' INT
while :; do sleep 0.05; done
"#;

/// Stands in for `netcat -l`: prints whatever a container "sent".
const LISTENER: &str = r#"#!/bin/sh
STATE='@STATE@'
while [ ! -f "$STATE/net.msg" ]; do sleep 0.05; done
cat "$STATE/net.msg"
"#;

pub struct FakeDobby {
    pub dir: TempDir,
    pub config: HarnessConfig,
    _serial: MutexGuard<'static, ()>,
}

impl FakeDobby {
    pub fn new(platform: Platform) -> Self {
        let serial = SERIAL.lock();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["bin", "state", "specs", "bundles", "logs", "dump", "cgroup"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        let fill = |template: &str| {
            template
                .replace("@STATE@", &root.join("state").display().to_string())
                .replace("@LOGS@", &root.join("logs").display().to_string())
                .replace("@DUMP@", &root.join("dump").display().to_string())
                .replace("@CGROUP@", &root.join("cgroup").display().to_string())
        };
        let daemon = write_script(&root.join("bin/DobbyDaemon"), &fill(DAEMON));
        let tool = write_script(&root.join("bin/DobbyTool"), &fill(TOOL));
        let generator = write_script(&root.join("bin/DobbyBundleGenerator"), GENERATOR);
        let helper = write_script(&root.join("bin/start_memcr.sh"), &fill(HELPER));
        let listener = write_script(&root.join("bin/netcat"), &fill(LISTENER));

        let config = HarnessConfig {
            verbosity: Verbosity::Debug,
            platform,
            daemon_program: daemon,
            tool_program: tool,
            bundle_generator_program: generator,
            // exec so the interrupt reaches the script, not a wrapping shell
            helper_start_command: format!("exec {helper}"),
            listener_program: listener,
            privilege_wrapper: None,
            purge_stray_daemon: false,
            spec_dir: root.join("specs"),
            bundle_dir: root.join("bundles"),
            container_log_dir: root.join("logs"),
            checkpoint_dump_dir: root.join("dump"),
            cgroup_pids_root: root.join("cgroup"),
            report_path: root.join("DobbyL2TestResults.json"),
            event_log: None,
            timings: Timings::default().scaled(0.1),
            ..HarnessConfig::default()
        };
        Self {
            dir,
            config,
            _serial: serial,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// `specs/<id>.json`; its content becomes the container's log.
    pub fn add_spec(&self, container_id: &str, payload: &str) {
        fs::write(self.config.spec_path(container_id), payload).unwrap();
    }

    /// `bundles/<id>_bundle.tar.gz` holding `payload` plus extra files.
    pub fn add_bundle(&self, container_id: &str, payload: &str, extra: &[(&str, &str)]) -> PathBuf {
        write_bundle_archive(&self.config.bundle_dir, container_id, payload, extra)
    }

    /// Make the fake daemon or tool misbehave. Daemon: `segv` (on stop),
    /// `startup_segv`, `startup_exit`. Tool: `hibernate` (no dump files),
    /// `hibernate_state`, `wakeup`, `restore` (dump files kept), `pids`
    /// (new pids after wakeup).
    pub fn inject_fault(&self, fault: &str) {
        fs::write(self.root().join("state").join(format!("fault.{fault}")), "").unwrap();
    }

    pub fn daemon_up(&self) -> bool {
        self.root().join("state/daemon.up").exists()
    }

    pub fn helper_interrupted(&self) -> bool {
        self.root().join("state/helper.interrupted").exists()
    }

    pub fn dump_entries(&self) -> usize {
        fs::read_dir(&self.config.checkpoint_dump_dir).unwrap().count()
    }
}

fn write_script(path: &Path, body: &str) -> String {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

/// Write `<dir>/<id>_bundle.tar.gz` containing `<id>_bundle/payload`.
pub fn write_bundle_archive(
    dir: &Path,
    container_id: &str,
    payload: &str,
    extra: &[(&str, &str)],
) -> PathBuf {
    let root = format!("{container_id}_bundle");
    let archive = dir.join(format!("{root}.tar.gz"));
    let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let files = std::iter::once(("payload", payload)).chain(extra.iter().copied());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("{root}/{name}"), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    archive
}
