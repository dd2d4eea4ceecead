//! End-to-end environment flows against fake kernel tooling.
//!
//! Every external binary (`dd`, `losetup`, `mdadm`, `mkfs`, `mount`,
//! `cryptsetup`, ...) is a staged shell script keeping its state in a shared
//! directory, and sysfs / device-mapper probing is pointed at staged trees,
//! so the full build/teardown pipeline runs without root or real devices.

use freehold_core::error::FreeholdError;
use freehold_core::invoke::{ToolInvoker, ToolOutput};
use freehold_core::probe;
use freehold_core::{Environment, FreeholdConfig};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Invoker that resolves tools only from the staged bin directory.
#[derive(Clone)]
struct ScriptInvoker {
    bin: PathBuf,
}

impl ToolInvoker for ScriptInvoker {
    fn run(&self, tool: &str, args: &[&str]) -> freehold_core::FreeholdResult<ToolOutput> {
        let output = Command::new(self.bin.join(tool)).args(args).output()?;
        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    fn which(&self, tool: &str) -> Option<PathBuf> {
        let candidate = self.bin.join(tool);
        candidate.exists().then_some(candidate)
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    bin: PathBuf,
    state: PathBuf,
    sys: PathBuf,
    dev_mapper: PathBuf,
    mnt: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("space");
        let bin = tmp.path().join("bin");
        let state = tmp.path().join("state");
        let sys = tmp.path().join("sys");
        let dev_mapper = tmp.path().join("dev-mapper");
        let mnt = tmp.path().join("mnt");
        for dir in [&root, &bin, &state, &sys, &dev_mapper, &mnt] {
            fs::create_dir_all(dir).unwrap();
        }

        let harness = Self {
            _tmp: tmp,
            root,
            bin,
            state,
            sys,
            dev_mapper,
            mnt,
        };
        harness.stage_tools();
        harness
    }

    fn config(&self) -> FreeholdConfig {
        FreeholdConfig {
            root: self.root.clone(),
            md_name: "test0".into(),
            mapper_name: "test0".into(),
            data_pagesize: 1 << 20,
            ..FreeholdConfig::default()
        }
    }

    fn env(&self) -> Environment<ScriptInvoker> {
        Environment::new(
            self.config(),
            ScriptInvoker {
                bin: self.bin.clone(),
            },
        )
        .with_probe_roots(&self.sys, &self.dev_mapper, &self.mnt)
    }

    fn log(&self, tool: &str) -> String {
        fs::read_to_string(self.state.join(format!("{tool}.log"))).unwrap_or_default()
    }

    fn stage_tools(&self) {
        let state = self.state.display().to_string();
        let sys = self.sys.display().to_string();
        let dev_mapper = self.dev_mapper.display().to_string();

        write_executable(
            &self.bin.join("dd"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
echo "dd $*" >> "$STATE/dd.log"
IF=""; OF=""; BS=0; COUNT=0
for a in "$@"; do
  case "$a" in
    if=*) IF="${{a#if=}}" ;;
    of=*) OF="${{a#of=}}" ;;
    bs=*) BS="${{a#bs=}}" ;;
    count=*) COUNT="${{a#count=}}" ;;
  esac
done
[ -n "$OF" ] || exit 1
if [ "$IF" = "/dev/urandom" ]; then
  head -c $((BS * COUNT)) /dev/urandom > "$OF"
else
  truncate -s $((BS * COUNT)) "$OF"
fi
exit 0
"#
            ),
        );

        write_executable(
            &self.bin.join("losetup"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
echo "losetup $*" >> "$STATE/losetup.log"
LOOPS="$STATE/loops"
touch "$LOOPS"
case "$1" in
  --associated)
    while IFS='|' read -r dev file; do
      if [ "$file" = "$2" ]; then echo "/dev/$dev: []: ($file)"; fi
    done < "$LOOPS"
    exit 0
    ;;
  --find)
    FILE="$3"
    N=0
    while grep -q "^loop$N|" "$LOOPS"; do N=$((N + 1)); done
    echo "loop$N|$FILE" >> "$LOOPS"
    echo "/dev/loop$N"
    exit 0
    ;;
  -d)
    DEV="${{2#/dev/}}"
    grep -v "^$DEV|" "$LOOPS" > "$LOOPS.tmp" || true
    mv "$LOOPS.tmp" "$LOOPS"
    exit 0
    ;;
esac
echo "unsupported losetup $*" 1>&2
exit 1
"#
            ),
        );

        write_executable(
            &self.bin.join("file"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
if [ "$1" = "-b" ] && grep -Fqx "$2" "$STATE/raid_members" 2>/dev/null; then
  echo "Linux Software RAID version 1.2"
else
  echo "data"
fi
exit 0
"#
            ),
        );

        write_executable(
            &self.bin.join("mdadm"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
SYS="{sys}"
echo "mdadm $*" >> "$STATE/mdadm.log"
LOOPS="$STATE/loops"
stage_member() {{
  L="${{1#/dev/}}"
  BACKING=$(grep "^$L|" "$LOOPS" | cut -d'|' -f2)
  [ -n "$BACKING" ] || return 1
  mkdir -p "$SYS/md0/slaves/$L/loop"
  printf '%s\n' "$BACKING" > "$SYS/md0/slaves/$L/loop/backing_file"
}}
case "$1" in
  --create)
    shift 2
    while [ $# -gt 0 ]; do
      case "$1" in --level=*|--raid-devices=*) shift ;; *) break ;; esac
    done
    rm -rf "$SYS/md0"
    mkdir -p "$SYS/md0/md" "$SYS/md0/slaves"
    : > "$STATE/md_members"
    for dev in "$@"; do
      stage_member "$dev" || exit 1
      BACKING=$(grep "^${{dev#/dev/}}|" "$LOOPS" | cut -d'|' -f2)
      printf '%s\n' "$BACKING" >> "$STATE/raid_members"
      printf '%s\n' "$dev" >> "$STATE/md_members"
    done
    exit 0
    ;;
  --assemble)
    rm -rf "$SYS/md0"
    mkdir -p "$SYS/md0/md" "$SYS/md0/slaves"
    while read -r dev; do
      if ! stage_member "$dev"; then
        echo "mdadm: failed to find device $dev" 1>&2
        exit 1
      fi
    done < "$STATE/md_members"
    exit 0
    ;;
  --stop)
    rm -rf "$SYS/md0"
    exit 0
    ;;
esac
echo "unsupported mdadm $*" 1>&2
exit 1
"#
            ),
        );

        write_executable(
            &self.bin.join("mkfs"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
echo "mkfs $*" >> "$STATE/mkfs.log"
exit 0
"#
            ),
        );

        for tool in ["mount", "umount", "tar"] {
            write_executable(
                &self.bin.join(tool),
                &format!(
                    r#"#!/bin/sh
STATE="{state}"
echo "{tool} $*" >> "$STATE/{tool}.log"
exit 0
"#
                ),
            );
        }

        // The download always fails here; the safe-zone must stay usable.
        write_executable(
            &self.bin.join("curl"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
echo "curl $*" >> "$STATE/curl.log"
echo "curl: (6) could not resolve host" 1>&2
exit 6
"#
            ),
        );

        write_executable(
            &self.bin.join("cryptsetup"),
            &format!(
                r#"#!/bin/sh
STATE="{state}"
DEVMAPPER="{dev_mapper}"
echo "cryptsetup $*" >> "$STATE/cryptsetup.log"
TUPLES="$STATE/tuples"
CMD="$1"
shift
case "$CMD" in
  luksFormat)
    shift
    KEYFILE=""; KOFF=""; HEADER=""; ALIGN=""
    while [ $# -gt 0 ]; do
      case "$1" in
        --type|--key-size) shift 2 ;;
        --batch-mode) shift ;;
        --key-file) KEYFILE="$2"; shift 2 ;;
        --keyfile-offset) KOFF="$2"; shift 2 ;;
        --header) HEADER="$2"; shift 2 ;;
        --align-payload) ALIGN="$2"; shift 2 ;;
        *) shift ;;
      esac
    done
    head -c 4096 /dev/urandom > "$HEADER"
    echo "$HEADER|$KEYFILE|$KOFF|$ALIGN" >> "$TUPLES"
    exit 0
    ;;
  luksOpen)
    NAME="$2"
    shift 2
    KEYFILE=""; KOFF=""; HEADER=""
    while [ $# -gt 0 ]; do
      case "$1" in
        --key-size) shift 2 ;;
        --key-file) KEYFILE="$2"; shift 2 ;;
        --keyfile-offset) KOFF="$2"; shift 2 ;;
        --header) HEADER="$2"; shift 2 ;;
        *) shift ;;
      esac
    done
    if grep -Fq "$HEADER|$KEYFILE|$KOFF|" "$TUPLES" 2>/dev/null; then
      touch "$DEVMAPPER/$NAME"
      exit 0
    fi
    echo "No key available with this passphrase." 1>&2
    exit 2
    ;;
  luksClose)
    rm -f "$DEVMAPPER/$1"
    exit 0
    ;;
esac
echo "unsupported cryptsetup $*" 1>&2
exit 1
"#
            ),
        );

        // Present for preflight only; the builder invokes `mkfs -t f2fs`.
        write_executable(&self.bin.join("mkfs.f2fs"), "#!/bin/sh\nexit 0\n");
    }
}

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn uuid_files(dir: &Path) -> Vec<PathBuf> {
    probe::uuid_entries(dir).unwrap()
}

#[test]
fn full_build_then_teardown_leaves_nothing() {
    let harness = Harness::new();
    let env = harness.env();
    env.preflight().unwrap();

    let allocation = env.pages_create(None, 3, false).unwrap();
    assert_eq!(allocation.pages.len(), 3);
    for page in &allocation.pages {
        assert_eq!(fs::metadata(page).unwrap().len(), 1 << 20);
    }

    let array = env.md_start().unwrap();
    assert_eq!(array.kernel_name, "md0");
    assert_eq!(
        array.members,
        vec!["/dev/loop0", "/dev/loop1", "/dev/loop2"]
    );

    let state = env.status().unwrap();
    assert!(state.backing_active);
    assert_eq!(state.md_name.as_deref(), Some("test0"));
    assert!(!state.luks_open);

    // Safe-zone: formatted, seeded best-effort (the staged curl always
    // fails), unmounted, mountpoint removed.
    env.populate_safezone().unwrap();
    let mkfs_log = harness.log("mkfs");
    assert!(mkfs_log.contains("-t f2fs -w 512"));
    assert!(mkfs_log.contains("2095104"));
    if probe::statvfs(&harness.mnt).unwrap().bytes_available >= 800 << 20 {
        assert!(!harness.log("curl").is_empty());
    }
    assert!(!harness.log("umount").is_empty());
    assert_eq!(fs::read_dir(&harness.mnt).unwrap().count(), 0);

    env.pde_stop().unwrap();
    env.md_stop().unwrap();
    assert!(env.md_status().unwrap().is_none());
    let set = env.pages_deactivate().unwrap();
    assert!(set.loop_devices().is_empty());
    env.pages_remove(true).unwrap();

    assert!(uuid_files(&harness.root).is_empty());
    let state = env.status().unwrap();
    assert!(!state.backing_active);
    assert!(state.md_name.is_none());
    assert!(!state.luks_open);
}

#[test]
fn insufficient_space_creates_no_files() {
    let harness = Harness::new();
    let env = harness.env();

    let free = probe::statvfs(&harness.root).unwrap().bytes_available;
    let err = env
        .pages_create(Some(free.saturating_mul(2).max(1 << 30)), 1, false)
        .unwrap_err();
    match err {
        FreeholdError::InsufficientSpace { needed, available } => {
            assert!(needed > available);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(uuid_files(&harness.root).is_empty());
    assert!(harness.log("dd").is_empty());
}

#[test]
fn rediscovery_is_idempotent() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 2, false).unwrap();
    let first = env.pages_activate().unwrap();
    assert!(first.active());

    let attach_calls = |log: &str| {
        log.lines()
            .filter(|line| line.contains("--find --show"))
            .count()
    };
    assert_eq!(attach_calls(&harness.log("losetup")), 2);

    let second = env.pages_activate().unwrap();
    assert_eq!(first, second);
    assert_eq!(attach_calls(&harness.log("losetup")), 2);

    // A plain listing never attaches either.
    let listed = env.pages_list().unwrap();
    assert_eq!(first, listed);
    assert_eq!(attach_calls(&harness.log("losetup")), 2);
}

#[test]
fn stripe_order_survives_reassembly() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 3, false).unwrap();
    let created = env.md_start().unwrap();
    env.md_stop().unwrap();
    assert!(env.md_status().unwrap().is_none());

    let assembled = env.md_start().unwrap();
    assert_eq!(created.members, assembled.members);

    let mdadm_log = harness.log("mdadm");
    assert_eq!(mdadm_log.matches("--create").count(), 1);
    assert_eq!(mdadm_log.matches("--assemble").count(), 1);
}

#[test]
fn md_start_adopts_a_running_array() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 2, false).unwrap();
    let first = env.md_start().unwrap();
    let second = env.md_start().unwrap();
    assert_eq!(first, second);

    // Adoption must not re-run mdadm.
    assert_eq!(harness.log("mdadm").matches("--create").count(), 1);
    assert_eq!(harness.log("mdadm").matches("--assemble").count(), 0);
}

#[test]
fn md_start_without_pages_is_refused() {
    let harness = Harness::new();
    let env = harness.env();
    let err = env.md_start().unwrap_err();
    assert!(matches!(err, FreeholdError::PreconditionUnmet(_)));
}

#[test]
fn headers_create_returns_the_only_copy_of_each_tuple() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 2, false).unwrap();
    // Auto-starts the array on the way.
    let records = env.headers_create(Some(3)).unwrap();
    assert_eq!(records.len(), 3);
    assert!(env.md_status().unwrap().is_some());

    let keys = env.keys_list().unwrap();
    assert_eq!(keys.len(), 3);
    for key in &keys {
        let meta = fs::metadata(harness.root.join(".k").join(&key.name)).unwrap();
        assert_eq!(meta.len(), 8192);
    }
    assert_eq!(env.headers_list().unwrap().len(), 3);

    for record in &records {
        assert!(record.keyfile_offset <= 8192 - 512);
        assert!((2_097_152..=2_099_200).contains(&record.payload_offset));
        assert!(keys.iter().any(|key| key.name == record.key));
    }
}

#[test]
fn only_the_recorded_tuple_opens_the_mapping() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 2, false).unwrap();
    let records = env.headers_create(Some(2)).unwrap();
    let chosen = &records[0];
    let other = &records[1];

    // Wrong offset.
    let err = env
        .pde_start(&chosen.header, &chosen.key, chosen.keyfile_offset + 1, false)
        .unwrap_err();
    assert!(matches!(err, FreeholdError::WrongTuple { .. }));
    assert!(!env.status().unwrap().luks_open);

    // Wrong key.
    let err = env
        .pde_start(&chosen.header, &other.key, chosen.keyfile_offset, false)
        .unwrap_err();
    assert!(matches!(err, FreeholdError::WrongTuple { .. }));

    // Unknown header name.
    let err = env
        .pde_start(
            "00000000-0000-4000-8000-000000000000",
            &chosen.key,
            chosen.keyfile_offset,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, FreeholdError::NotFound { .. }));

    // The recorded tuple opens, blessing formats ext4, stop closes.
    env.pde_start(&chosen.header, &chosen.key, chosen.keyfile_offset, true)
        .unwrap();
    assert!(env.status().unwrap().luks_open);
    assert!(harness.log("mkfs").contains("-t ext4"));

    env.pde_stop().unwrap();
    assert!(!env.status().unwrap().luks_open);
    // Idempotent over the closed state.
    env.pde_stop().unwrap();
}

#[test]
fn destructive_commands_require_affirmation() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 1, false).unwrap();
    env.headers_create(Some(1)).unwrap();
    env.md_stop().unwrap();
    env.pages_deactivate().unwrap();

    assert!(matches!(
        env.pages_remove(false),
        Err(FreeholdError::RefusedUnconfirmed(_))
    ));
    assert!(matches!(
        env.keys_remove(false),
        Err(FreeholdError::RefusedUnconfirmed(_))
    ));
    assert!(matches!(
        env.headers_remove(false),
        Err(FreeholdError::RefusedUnconfirmed(_))
    ));

    assert_eq!(uuid_files(&harness.root).len(), 1);
    assert_eq!(uuid_files(&harness.root.join(".k")).len(), 1);
    assert_eq!(uuid_files(&harness.root.join(".h")).len(), 1);

    env.pages_remove(true).unwrap();
    env.keys_remove(true).unwrap();
    env.headers_remove(true).unwrap();
    assert!(uuid_files(&harness.root).is_empty());
    assert!(uuid_files(&harness.root.join(".k")).is_empty());
    assert!(uuid_files(&harness.root.join(".h")).is_empty());
}

#[test]
fn pages_remove_refuses_while_attached() {
    let harness = Harness::new();
    let env = harness.env();

    env.pages_create(None, 1, false).unwrap();
    env.pages_activate().unwrap();
    let err = env.pages_remove(true).unwrap_err();
    assert!(matches!(err, FreeholdError::PreconditionUnmet(_)));
    assert_eq!(uuid_files(&harness.root).len(), 1);
}

#[test]
fn simulated_allocation_writes_nothing() {
    let harness = Harness::new();
    let env = harness.env();

    let allocation = env.pages_create(None, 4, true).unwrap();
    assert!(allocation.simulated);
    assert_eq!(allocation.pages.len(), 4);
    assert!(uuid_files(&harness.root).is_empty());
    assert!(harness.log("dd").is_empty());
}
