//! QEMU process backend.
//!
//! Each running machine is one detached hypervisor process. The host
//! forwards a localhost port to the guest's sshd; a machine counts as
//! Running once that port answers with an SSH banner. Graceful shutdown
//! goes through the QMP control socket, falling back to signals.

use super::ssh::{self, SshOutput, IDENTITY_FILENAME};
use super::store::MachineStore;
use super::MachineBackend;
use crate::config::{Paths, VmctlConfig};
use crate::error::{Error, ResourceKind, Result};
use crate::machine::{self, Machine, MachineSpec, MachineState, ResourceUpdate, SshCoordinates};
use crate::poll::{poll_until, Backoff, CancelFlag, PollOutcome};
use crate::process;
use crate::storage::{remove_file_if_exists, DiskImage};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Disk image file name inside a machine directory.
pub const DISK_FILENAME: &str = "disk.raw";
/// QMP control socket file name.
pub const QMP_SOCKET_FILENAME: &str = "qmp.sock";
/// Guest serial console log.
pub const CONSOLE_LOG_FILENAME: &str = "console.log";
/// Hypervisor stdout/stderr log.
pub const HYPERVISOR_LOG_FILENAME: &str = "hypervisor.log";

/// Timeout for a single readiness probe or QMP exchange.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings the backend needs from the global configuration.
#[derive(Debug, Clone)]
struct QemuSettings {
    binary: String,
    extra_args: Vec<String>,
    ssh_binary: String,
    ssh_keygen_binary: String,
    ssh_user: String,
    boot_timeout: Duration,
    shutdown_timeout: Duration,
}

/// Process-based QEMU backend.
#[derive(Debug, Clone)]
pub struct QemuBackend {
    settings: QemuSettings,
    store: MachineStore,
}

impl QemuBackend {
    /// Create a backend storing machines under `paths.machines_dir()`.
    pub fn new(config: &VmctlConfig, paths: &Paths) -> Self {
        Self {
            settings: QemuSettings {
                binary: config.hypervisor_binary.clone(),
                extra_args: config.hypervisor_args.clone(),
                ssh_binary: config.ssh_binary.clone(),
                ssh_keygen_binary: config.ssh_keygen_binary.clone(),
                ssh_user: config.ssh_user.clone(),
                boot_timeout: config.boot_timeout,
                shutdown_timeout: config.shutdown_timeout,
            },
            store: MachineStore::new(paths.machines_dir(), config.lock_timeout),
        }
    }

    /// The metadata store.
    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    fn artifact(&self, name: &str, file: &str) -> PathBuf {
        self.store.machine_dir(name).join(file)
    }

    /// Build the hypervisor command line for `machine`.
    pub fn hypervisor_command(&self, machine: &Machine) -> Command {
        let qmp = self.artifact(&machine.name, QMP_SOCKET_FILENAME);
        let console = self.artifact(&machine.name, CONSOLE_LOG_FILENAME);

        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(["-name", &machine.name])
            .args(["-m", &machine.resources.memory_mib.to_string()])
            .args(["-smp", &machine.resources.cpus.to_string()])
            .arg("-drive")
            .arg(format!(
                "if=virtio,format=raw,file={}",
                machine.disk_path.display()
            ))
            .arg("-netdev")
            .arg(format!(
                "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
                machine.ssh.port
            ))
            .args(["-device", "virtio-net-pci,netdev=net0"])
            .arg("-qmp")
            .arg(format!("unix:{},server=on,wait=off", qmp.display()))
            .args(["-display", "none"])
            .arg("-serial")
            .arg(format!("file:{}", console.display()))
            .args(&self.settings.extra_args);
        cmd
    }

    /// Spawn the hypervisor detached from our session. Returns its pid.
    fn spawn(&self, machine: &Machine) -> Result<i32> {
        let log = File::create(self.artifact(&machine.name, HYPERVISOR_LOG_FILENAME))?;
        let log_err = log.try_clone()?;
        let _ = remove_file_if_exists(&self.artifact(&machine.name, QMP_SOCKET_FILENAME));

        let mut cmd = self.hypervisor_command(machine);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // New session, so the hypervisor outlives this invocation and does
        // not receive the terminal's signals.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BackendUnavailable(format!(
                    "hypervisor binary '{}' not found",
                    self.settings.binary
                ))
            } else {
                Error::Backend(format!("failed to spawn {}: {}", self.settings.binary, e))
            }
        })?;

        let pid = child.id() as i32;
        tracing::debug!(machine = %machine.name, pid, "spawned hypervisor");
        Ok(pid)
    }

    /// Wait for the booting machine to answer on its tunnel port.
    fn wait_for_ready(
        &self,
        name: &str,
        pid: i32,
        port: u16,
        cancel: Option<&CancelFlag>,
    ) -> Result<PollOutcome<()>> {
        let log = self.artifact(name, HYPERVISOR_LOG_FILENAME);
        poll_until(
            self.settings.boot_timeout,
            Backoff::exponential(Duration::from_millis(250), Duration::from_secs(2)),
            cancel,
            || {
                if !process::is_alive(pid) {
                    return Err(Error::Backend(format!(
                        "hypervisor for machine '{}' exited during boot (see {})",
                        name,
                        log.display()
                    )));
                }
                Ok(ssh::probe_banner(port, PROBE_TIMEOUT).then_some(()))
            },
        )
    }

    /// Ask the guest to power down via QMP.
    fn request_powerdown(&self, name: &str) -> Result<()> {
        let socket = self.artifact(name, QMP_SOCKET_FILENAME);
        let stream = UnixStream::connect(&socket)?;
        stream.set_read_timeout(Some(PROBE_TIMEOUT))?;
        stream.set_write_timeout(Some(PROBE_TIMEOUT))?;

        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        // Greeting, then capabilities negotiation, then the command.
        qmp_read(&mut reader)?;
        for command in ["qmp_capabilities", "system_powerdown"] {
            let request = serde_json::json!({ "execute": command });
            writeln!(writer, "{}", request)?;
            let reply = qmp_read(&mut reader)?;
            if let Some(err) = reply.get("error") {
                return Err(Error::Backend(format!("qmp {} failed: {}", command, err)));
            }
        }
        Ok(())
    }

    /// Bring a record in line with its hypervisor process.
    ///
    /// A dead process means Stopped. A Starting machine whose tunnel now
    /// answers is Running. Returns true if the record changed.
    fn settle(machine: &mut Machine) -> bool {
        if !machine.state.owns_process() {
            return false;
        }
        if !machine.pid.is_some_and(process::is_alive) {
            tracing::debug!(
                machine = %machine.name,
                recorded = %machine.state,
                "hypervisor process gone, treating machine as stopped"
            );
            machine.mark_stopped();
            return true;
        }
        if machine.state == MachineState::Starting
            && ssh::probe_banner(machine.ssh.port, PROBE_TIMEOUT)
        {
            tracing::debug!(machine = %machine.name, "tunnel answers, machine is running");
            machine.mark_running();
            return true;
        }
        false
    }

    /// Read-side view: settle the record without writing it back.
    fn observe(&self, mut machine: Machine) -> Machine {
        Self::settle(&mut machine);
        machine
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(format!(
                "hypervisor '{}' is not installed or not runnable",
                self.settings.binary
            )))
        }
    }

    /// Create artifacts and the record for a new machine.
    fn provision(&self, spec: &MachineSpec, dir: &Path) -> Result<Machine> {
        let disk_path = dir.join(DISK_FILENAME);
        match &spec.image_path {
            Some(base) => DiskImage::create_from_base(base, &disk_path, spec.resources.disk_size_gb)?,
            None => DiskImage::create_sparse(&disk_path, spec.resources.disk_size_gb)?,
        };

        let identity = dir.join(IDENTITY_FILENAME);
        ssh::generate_keypair(&self.settings.ssh_keygen_binary, &identity, &spec.name)?;

        let taken: Vec<u16> = self.store.list()?.iter().map(|m| m.ssh.port).collect();
        let port = ssh::allocate_port(&taken)?;

        let machine = Machine::new(
            &spec.name,
            spec.resources,
            SshCoordinates {
                identity_path: identity,
                port,
                user: self.settings.ssh_user.clone(),
            },
            disk_path,
        );
        self.store.save(&machine)?;
        Ok(machine)
    }

    /// Spawn the hypervisor for `machine`, mark it Starting and hand the
    /// record to `persist`. If persisting fails the process is killed
    /// again and the machine is left as it was.
    fn launch<F>(&self, machine: &mut Machine, persist: F) -> Result<i32>
    where
        F: FnOnce(&Machine) -> Result<()>,
    {
        let pid = self.spawn(machine)?;
        machine.mark_starting(pid);
        if let Err(e) = persist(machine) {
            tracing::warn!(machine = %machine.name, pid, error = %e, "failed to record hypervisor, killing it");
            if process::kill(pid) {
                process::wait_for_exit(pid, Duration::from_secs(5));
            }
            machine.mark_stopped();
            return Err(e);
        }
        Ok(pid)
    }

    /// Mark a machine Broken after a failed boot, killing what is left.
    ///
    /// Failures are logged; the caller reports the boot failure itself.
    fn fail_start(&self, name: &str, pid: i32) {
        if process::kill(pid) {
            process::wait_for_exit(pid, Duration::from_secs(5));
        }
        let marked = self.store.update(name, |m| {
            if m.pid == Some(pid) {
                m.mark_broken();
            }
            Ok(())
        });
        if let Err(e) = marked {
            tracing::warn!(machine = %name, pid, error = %e, "failed to mark machine broken");
        }
    }
}

/// Read one QMP message, skipping asynchronous events.
fn qmp_read(reader: &mut impl BufRead) -> Result<serde_json::Value> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::Backend("qmp connection closed".into()));
        }
        let value: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| Error::Backend(format!("malformed qmp message: {}", e)))?;
        if value.get("event").is_none() {
            return Ok(value);
        }
    }
}

impl MachineBackend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn is_available(&self) -> bool {
        Command::new(&self.settings.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init(&self, spec: &MachineSpec) -> Result<Machine> {
        machine::validate_name(&spec.name)?;
        spec.resources.validate()?;

        let _lock = self.store.lock()?;
        if self.store.exists(&spec.name) {
            return Err(Error::DuplicateName {
                kind: ResourceKind::Machine,
                name: spec.name.clone(),
            });
        }

        // A directory without a record is debris from an interrupted init.
        let dir = self.store.machine_dir(&spec.name);
        if dir.exists() {
            tracing::warn!(machine = %spec.name, "removing leftovers of an earlier init");
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::allocation(format!("failed to create {}: {}", dir.display(), e))
        })?;

        match self.provision(spec, &dir) {
            Ok(machine) => {
                tracing::info!(
                    machine = %machine.name,
                    port = machine.ssh.port,
                    "machine initialized"
                );
                Ok(machine)
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(machine = %spec.name, error = %cleanup, "failed to clean up after init");
                }
                Err(e)
            }
        }
    }

    fn start(&self, name: &str, cancel: Option<&CancelFlag>) -> Result<Machine> {
        self.check_available()?;

        // Claim the machine under the lock: only one invocation gets to
        // move it from Stopped to Starting.
        let (machine, pid) = {
            let _lock = self.store.lock()?;
            let mut machine = self.store.load(name)?;
            if Self::settle(&mut machine) {
                self.store.save(&machine)?;
            }
            if !machine.state.can_start() {
                return Err(machine.invalid_state("start", "stopped"));
            }
            let pid = self.launch(&mut machine, |m| self.store.save(m))?;
            (machine, pid)
        };

        tracing::info!(machine = %name, pid, port = machine.ssh.port, "waiting for machine to boot");

        match self.wait_for_ready(name, pid, machine.ssh.port, cancel) {
            Ok(PollOutcome::Ready(())) => {
                let (machine, ()) = self.store.update(name, |m| {
                    if m.pid != Some(pid) {
                        return Err(Error::Backend(format!(
                            "machine '{}' was modified while starting",
                            name
                        )));
                    }
                    m.mark_running();
                    Ok(())
                })?;
                tracing::info!(machine = %name, pid, "machine running");
                Ok(machine)
            }
            Ok(PollOutcome::TimedOut) => {
                tracing::warn!(machine = %name, pid, "machine did not become ready");
                self.fail_start(name, pid);
                Err(Error::StartTimeout {
                    name: name.to_string(),
                    timeout: self.settings.boot_timeout,
                })
            }
            Ok(PollOutcome::Cancelled) => Err(Error::Interrupted(format!(
                "start of machine '{}' cancelled; it remains starting",
                name
            ))),
            Err(e) => {
                self.fail_start(name, pid);
                Err(e)
            }
        }
    }

    fn stop(&self, name: &str) -> Result<Machine> {
        let (machine, ()) = self.store.update(name, |m| {
            Self::settle(m);
            if !m.state.can_stop() {
                return Err(m.invalid_state("stop", "running"));
            }
            m.state = MachineState::Stopping;
            Ok(())
        })?;

        if let Some(pid) = machine.pid {
            tracing::info!(machine = %name, pid, "stopping machine");
            match self.request_powerdown(name) {
                Ok(()) => {
                    if !process::wait_for_exit(pid, self.settings.shutdown_timeout) {
                        tracing::warn!(machine = %name, pid, "guest ignored powerdown, killing");
                        process::kill(pid);
                        process::wait_for_exit(pid, Duration::from_secs(5));
                    }
                }
                Err(e) => {
                    tracing::debug!(machine = %name, error = %e, "qmp powerdown failed, signalling");
                    if process::terminate_with_grace(pid, self.settings.shutdown_timeout) {
                        tracing::warn!(machine = %name, pid, "hypervisor killed after grace period");
                    }
                }
            }
        }

        let _ = remove_file_if_exists(&self.artifact(name, QMP_SOCKET_FILENAME));
        let (machine, ()) = self.store.update(name, |m| {
            m.mark_stopped();
            Ok(())
        })?;

        tracing::info!(machine = %name, "machine stopped");
        Ok(machine)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let _lock = self.store.lock()?;
        let mut machine = self.store.load(name)?;
        if Self::settle(&mut machine) {
            self.store.save(&machine)?;
        }
        if machine.state.owns_process() {
            return Err(machine.invalid_state("remove", "stopped or broken"));
        }

        let dir = self.store.machine_dir(name);
        let artifacts = [
            machine.disk_path.clone(),
            machine.ssh.identity_path.clone(),
            machine.ssh.identity_path.with_extension("pub"),
            dir.join(QMP_SOCKET_FILENAME),
            dir.join(CONSOLE_LOG_FILENAME),
            dir.join(HYPERVISOR_LOG_FILENAME),
        ];
        for path in &artifacts {
            if let Err(e) = remove_file_if_exists(path) {
                // Leave a record behind so remove can be retried.
                tracing::warn!(machine = %name, path = %path.display(), error = %e, "remove failed");
                machine.mark_broken();
                self.store.save(&machine)?;
                return Err(e);
            }
        }

        self.store.delete(name)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(machine = %name, error = %e, "failed to remove machine directory")
            }
        }

        tracing::info!(machine = %name, "machine removed");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Machine>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|m| self.observe(m))
            .collect())
    }

    fn inspect(&self, name: &str) -> Result<Machine> {
        self.store.load(name).map(|m| self.observe(m))
    }

    fn reconcile(&self, name: &str) -> Result<Machine> {
        let (machine, changed) = self.store.update(name, |m| Ok(Self::settle(m)))?;
        if changed {
            tracing::info!(machine = %name, state = %machine.state, "machine state reconciled");
        }
        Ok(machine)
    }

    fn ssh(&self, name: &str, command: &[String]) -> Result<SshOutput> {
        let machine = self.inspect(name)?;
        if machine.state != MachineState::Running {
            return Err(machine.invalid_state("ssh into", "running"));
        }
        ssh::run(&self.settings.ssh_binary, &machine.ssh, command)
    }

    fn set_resources(&self, name: &str, update: &ResourceUpdate) -> Result<Machine> {
        let (machine, ()) = self.store.update(name, |m| {
            Self::settle(m);
            if !m.state.can_modify() {
                return Err(m.invalid_state("modify", "stopped"));
            }

            let next = update.apply(m.resources);
            next.validate()?;
            if next.disk_size_gb != m.resources.disk_size_gb {
                DiskImage::open(&m.disk_path)?.grow(next.disk_size_gb)?;
            }
            m.resources = next;
            Ok(())
        })?;

        tracing::info!(machine = %name, resources = ?machine.resources, "machine resources updated");
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Resources;
    use std::net::{Ipv4Addr, TcpListener};
    use std::os::unix::fs::PermissionsExt;

    /// Hypervisor stand-in: answers `--version`, otherwise sleeps until
    /// signalled.
    const FAKE_HYPERVISOR: &str =
        "#!/bin/sh\ncase \"$1\" in --version) echo 'QEMU emulator version 8.2.0'; exit 0;; esac\nexec sleep 30\n";

    /// Hypervisor stand-in that dies immediately.
    const CRASHING_HYPERVISOR: &str =
        "#!/bin/sh\ncase \"$1\" in --version) exit 0;; esac\necho 'could not access KVM' >&2\nexit 1\n";

    /// ssh-keygen stand-in writing files at the `-f` path.
    const FAKE_KEYGEN: &str = "#!/bin/sh\nwhile [ $# -gt 0 ]; do if [ \"$1\" = \"-f\" ]; then f=\"$2\"; fi; shift; done\necho private > \"$f\"\necho public > \"$f.pub\"\n";

    struct Harness {
        dir: tempfile::TempDir,
        backend: QemuBackend,
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn harness_with(hypervisor: &str, boot_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();

        let config = VmctlConfig {
            hypervisor_binary: script(&bin, "qemu", hypervisor),
            ssh_keygen_binary: script(&bin, "ssh-keygen", FAKE_KEYGEN),
            boot_timeout,
            shutdown_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let paths = Paths::from_root(dir.path().join("state"));
        Harness {
            backend: QemuBackend::new(&config, &paths),
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(FAKE_HYPERVISOR, Duration::from_secs(10))
    }

    fn small_spec(name: &str) -> MachineSpec {
        MachineSpec::new(name).resources(Resources {
            cpus: 1,
            memory_mib: 512,
            disk_size_gb: 1,
        })
    }

    /// Serve an SSH banner on a fresh port and point the machine at it.
    fn serve_banner(backend: &QemuBackend, name: &str) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                if let Ok(mut s) = stream {
                    let _ = s.write_all(b"SSH-2.0-OpenSSH_9.6\r\n");
                }
            }
        });
        backend
            .store()
            .update(name, |m| {
                m.ssh.port = port;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_init_creates_stopped_machine_with_artifacts() {
        let h = harness();
        let m = h.backend.init(&small_spec("vm1")).unwrap();

        assert_eq!(m.state, MachineState::Stopped);
        assert!(m.pid.is_none());
        assert!(m.disk_path.is_file());
        assert!(m.ssh.identity_path.is_file());
        assert!(m.ssh.identity_path.with_extension("pub").is_file());
        assert_eq!(m.ssh.user, "core");
        assert_eq!(h.backend.inspect("vm1").unwrap(), m);
    }

    #[test]
    fn test_init_duplicate_and_invalid_names() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();

        let err = h.backend.init(&small_spec("vm1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));

        let err = h.backend.init(&small_spec("../escape")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_init_rejects_oversized_disk() {
        let h = harness();
        let spec = MachineSpec::new("vm1").resources(Resources {
            cpus: 1,
            memory_mib: 512,
            disk_size_gb: 1 << 34,
        });
        let err = h.backend.init(&spec).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
        assert!(!h.backend.store().machine_dir("vm1").exists());
    }

    #[test]
    fn test_init_failure_leaves_nothing_behind() {
        let h = harness();
        let broken = QemuBackend {
            settings: QemuSettings {
                ssh_keygen_binary: "/nonexistent/ssh-keygen".into(),
                ..h.backend.settings.clone()
            },
            store: h.backend.store.clone(),
        };

        let err = broken.init(&small_spec("vm1")).unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation(_)));
        assert!(!broken.store().machine_dir("vm1").exists());
        assert!(broken.inspect("vm1").unwrap_err().is_not_found(ResourceKind::Machine));
    }

    #[test]
    fn test_init_with_missing_base_image_fails_cleanly() {
        let h = harness();
        let spec = small_spec("vm1").image(h.dir.path().join("absent.img"));
        let err = h.backend.init(&spec).unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation(_)));
        assert!(!h.backend.store().machine_dir("vm1").exists());
    }

    #[test]
    fn test_hypervisor_command_line() {
        let h = harness();
        let m = h.backend.init(&small_spec("vm1")).unwrap();
        let cmd = h.backend.hypervisor_command(&m);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-m") + 1], "512");
        assert_eq!(args[pos("-smp") + 1], "1");
        assert_eq!(
            args[pos("-netdev") + 1],
            format!("user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22", m.ssh.port)
        );
        assert!(args[pos("-qmp") + 1].contains(QMP_SOCKET_FILENAME));
    }

    #[test]
    fn test_start_and_stop_cycle() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        serve_banner(&h.backend, "vm1");

        let running = h.backend.start("vm1", None).unwrap();
        assert_eq!(running.state, MachineState::Running);
        let pid = running.pid.unwrap();
        assert!(process::is_alive(pid));
        assert_eq!(h.backend.inspect("vm1").unwrap().state, MachineState::Running);

        let err = h.backend.start("vm1", None).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let stopped = h.backend.stop("vm1").unwrap();
        assert_eq!(stopped.state, MachineState::Stopped);
        assert!(stopped.pid.is_none());
        assert!(!process::is_alive(pid));

        let err = h.backend.stop("vm1").unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_start_timeout_marks_broken_and_kills_process() {
        let h = harness_with(FAKE_HYPERVISOR, Duration::from_millis(600));
        h.backend.init(&small_spec("vm1")).unwrap();

        let err = h.backend.start("vm1", None).unwrap_err();
        assert!(matches!(err, Error::StartTimeout { .. }), "{:?}", err);

        let m = h.backend.inspect("vm1").unwrap();
        assert_eq!(m.state, MachineState::Broken);
        assert!(m.pid.is_none());

        let err = h.backend.start("vm1", None).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        h.backend.remove("vm1").unwrap();
        assert!(h.backend.inspect("vm1").is_err());
    }

    #[test]
    fn test_hypervisor_crash_during_boot_is_broken() {
        let h = harness_with(CRASHING_HYPERVISOR, Duration::from_secs(10));
        h.backend.init(&small_spec("vm1")).unwrap();

        let err = h.backend.start("vm1", None).unwrap_err();
        assert!(matches!(err, Error::Backend(_)), "{:?}", err);
        assert_eq!(h.backend.inspect("vm1").unwrap().state, MachineState::Broken);
    }

    #[test]
    fn test_missing_hypervisor_is_backend_unavailable() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let missing = QemuBackend {
            settings: QemuSettings {
                binary: "/nonexistent/qemu-system-x86_64".into(),
                ..h.backend.settings.clone()
            },
            store: h.backend.store.clone(),
        };

        assert!(!missing.is_available());
        let err = missing.start("vm1", None).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(missing.inspect("vm1").unwrap().state, MachineState::Stopped);
    }

    #[test]
    fn test_cancelled_start_is_reconciled_by_inspect() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = h.backend.start("vm1", Some(&cancel)).unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)));

        let record = h.backend.store().load("vm1").unwrap();
        assert_eq!(record.state, MachineState::Starting);
        let pid = record.pid.unwrap();

        // Still booting: reported as starting
        assert_eq!(h.backend.inspect("vm1").unwrap().state, MachineState::Starting);

        // Process gone: reported as stopped, and start works again
        process::kill(pid);
        assert!(process::wait_for_exit(pid, Duration::from_secs(5)));
        assert_eq!(h.backend.inspect("vm1").unwrap().state, MachineState::Stopped);
    }

    fn manager(h: &Harness) -> crate::lifecycle::MachineManager {
        let registry = crate::connection::ConnectionRegistry::new(
            h.dir.path().join("connections.toml"),
            Duration::from_secs(2),
        );
        crate::lifecycle::MachineManager::new(
            Box::new(h.backend.clone()),
            registry,
            "/run/podman/podman.sock",
        )
    }

    /// A process standing in for a hypervisor left behind by another
    /// invocation.
    fn orphan_hypervisor() -> i32 {
        Command::new("sleep").arg("30").spawn().unwrap().id() as i32
    }

    fn record_state(h: &Harness, name: &str, state: MachineState, pid: i32) {
        h.backend
            .store()
            .update(name, |m| {
                m.mark_starting(pid);
                m.state = state;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_abandoned_start_that_booted_is_promoted_and_stoppable() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        h.backend.start("vm1", Some(&cancel)).unwrap_err();
        serve_banner(&h.backend, "vm1");
        let pid = h.backend.store().load("vm1").unwrap().pid.unwrap();

        let mgr = manager(&h);
        let running = mgr.start_machine("vm1", false, None).unwrap();
        assert_eq!(running.state, MachineState::Running);
        assert_eq!(running.pid, Some(pid));
        assert_eq!(h.backend.store().load("vm1").unwrap().state, MachineState::Running);
        assert!(mgr.registry().get("vm1").is_ok());

        let stopped = mgr.stop_machine("vm1").unwrap();
        assert_eq!(stopped.state, MachineState::Stopped);
        assert!(!process::is_alive(pid));
        assert_eq!(h.backend.store().load("vm1").unwrap().state, MachineState::Stopped);
    }

    #[test]
    fn test_stuck_boot_and_stuck_shutdown_can_be_stopped() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let mgr = manager(&h);

        for state in [MachineState::Starting, MachineState::Stopping] {
            let pid = orphan_hypervisor();
            record_state(&h, "vm1", state, pid);

            let stopped = mgr.stop_machine("vm1").unwrap();
            assert_eq!(stopped.state, MachineState::Stopped, "from {}", state);
            assert!(stopped.pid.is_none());
            assert!(!process::is_alive(pid), "from {}", state);
        }

        // The machine is usable again afterwards
        serve_banner(&h.backend, "vm1");
        let running = mgr.start_machine("vm1", false, None).unwrap();
        assert_eq!(running.state, MachineState::Running);
        mgr.stop_machine("vm1").unwrap();
    }

    #[test]
    fn test_force_remove_of_stuck_boot() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let pid = orphan_hypervisor();
        record_state(&h, "vm1", MachineState::Starting, pid);
        let mgr = manager(&h);

        let err = mgr.remove_machine("vm1", false).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }), "{:?}", err);
        assert!(process::is_alive(pid));

        mgr.remove_machine("vm1", true).unwrap();
        assert!(!process::is_alive(pid));
        assert!(!h.backend.store().machine_dir("vm1").exists());
    }

    #[test]
    fn test_launch_kills_hypervisor_when_record_cannot_be_saved() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let mut machine = h.backend.store().load("vm1").unwrap();

        let mut spawned = None;
        let err = h
            .backend
            .launch(&mut machine, |m| {
                spawned = m.pid;
                Err(Error::Storage("no space left on device".into()))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Storage(_)));
        assert!(!process::is_alive(spawned.unwrap()));
        assert_eq!(machine.state, MachineState::Stopped);
        assert_eq!(h.backend.store().load("vm1").unwrap().state, MachineState::Stopped);
    }

    #[test]
    fn test_start_timeout_is_reported_even_if_record_vanished() {
        let h = harness_with(FAKE_HYPERVISOR, Duration::from_millis(600));
        h.backend.init(&small_spec("vm1")).unwrap();

        // Delete the record while the machine boots, so marking it broken
        // afterwards fails.
        let store = h.backend.store().clone();
        let watcher = std::thread::spawn(move || {
            for _ in 0..500 {
                if let Ok(m) = store.load("vm1") {
                    if m.state == MachineState::Starting {
                        store.delete("vm1").unwrap();
                        return m.pid;
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            None
        });

        let err = h.backend.start("vm1", None).unwrap_err();
        let pid = watcher.join().unwrap().expect("machine never reached starting");
        assert!(matches!(err, Error::StartTimeout { .. }), "{:?}", err);
        assert!(!process::is_alive(pid));
    }

    #[test]
    fn test_list_reports_dead_running_machine_as_stopped() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        h.backend.init(&small_spec("vm2")).unwrap();

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i32;
        child.wait().unwrap();
        h.backend
            .store()
            .update("vm2", |m| {
                m.mark_starting(dead_pid);
                m.mark_running();
                Ok(())
            })
            .unwrap();

        let listed = h.backend.list().unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["vm1", "vm2"]);
        assert_eq!(listed[1].state, MachineState::Stopped);
        assert!(listed[1].pid.is_none());
    }

    #[test]
    fn test_remove_refuses_running_and_tolerates_missing_files() {
        let h = harness();
        let m = h.backend.init(&small_spec("vm1")).unwrap();
        serve_banner(&h.backend, "vm1");
        h.backend.start("vm1", None).unwrap();

        let err = h.backend.remove("vm1").unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        h.backend.stop("vm1").unwrap();
        std::fs::remove_file(&m.disk_path).unwrap();
        h.backend.remove("vm1").unwrap();

        assert!(!h.backend.store().machine_dir("vm1").exists());
        assert!(h.backend.inspect("vm1").unwrap_err().is_not_found(ResourceKind::Machine));
        assert!(h.backend.remove("vm1").unwrap_err().is_not_found(ResourceKind::Machine));
    }

    #[test]
    fn test_ssh_requires_running() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();
        let err = h.backend.ssh("vm1", &["true".to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_set_resources_only_when_stopped() {
        let h = harness();
        h.backend.init(&small_spec("vm1")).unwrap();

        let m = h
            .backend
            .set_resources(
                "vm1",
                &ResourceUpdate {
                    cpus: Some(4),
                    disk_size_gb: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(m.resources.cpus, 4);
        assert_eq!(DiskImage::open(&m.disk_path).unwrap().size_gb(), 2);

        let err = h
            .backend
            .set_resources(
                "vm1",
                &ResourceUpdate {
                    disk_size_gb: Some(1),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(h.backend.inspect("vm1").unwrap().resources.disk_size_gb, 2);

        serve_banner(&h.backend, "vm1");
        h.backend.start("vm1", None).unwrap();
        let err = h
            .backend
            .set_resources(
                "vm1",
                &ResourceUpdate {
                    cpus: Some(1),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        h.backend.stop("vm1").unwrap();
    }

    #[test]
    fn test_qmp_read_skips_events() {
        let input = "{\"event\":\"POWERDOWN\"}\n{\"return\":{}}\n";
        let mut reader = std::io::Cursor::new(input.as_bytes());
        let value = qmp_read(&mut reader).unwrap();
        assert!(value.get("return").is_some());
        assert!(matches!(qmp_read(&mut reader), Err(Error::Backend(_))));
    }
}
