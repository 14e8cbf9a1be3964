//! The friscy launcher.
//!
//! Wires the host I/O bridge, builds the VFS from a rootfs tar, loads the entry ELF
//! (and its dynamic linker), lays out the initial stack, and drives the guest on a
//! dedicated execution thread. The host binding — a JNI layer, a terminal frontend —
//! owns a [`Launcher`] plus whatever [`Machine`] implementation embeds the actual
//! RISC-V interpreter.
//!
//! Execution model: the guest runs until it stops. A stop with the bridge's
//! waiting-for-stdin flag set parks the execution thread on the bridge condition
//! variable until input, EOF, or shutdown arrives; any other stop is a guest exit and
//! ends the session with an exit banner through the output callback.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use friscy::fs::VirtualFs;
use friscy::io::HostIo;
use friscy::machine::{
    reg, Machine, MachineError, PageAttributes, StopRequester, StopReason, PAGE_MASK, PAGE_SIZE,
};
use friscy_shim_linux::loader::elf::{get_load_range, get_writable_range, load_segments};
use friscy_shim_linux::loader::{parse_elf, stack, ElfKind};
use friscy_shim_linux::syscalls::handle_ecall;
use friscy_shim_linux::Runtime;

pub mod snapshot;

/// Instruction budget per `run` call; effectively unlimited.
const MAX_INSTRUCTIONS: u64 = 16_000_000_000;

/// Page-fault repairs tolerated per run episode before the fault counts as fatal.
const MAX_FAULT_REPAIRS: u32 = 8;

/// PIE base for the entry binary.
const ENTRY_PIE_BASE: u64 = 0x40000;

/// Version banner reported by [`Launcher::version`].
const VERSION: &str = concat!("friscy ", env!("CARGO_PKG_VERSION"), " | riscv64 userland");

/// Output callback: receives guest stdout/stderr and launcher banners. Called from the
/// execution thread; the host marshals to its UI thread as needed. Invalid UTF-8 is
/// passed through lossily.
pub type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Tunables for a guest session.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Native heap handed to the machine's mmap bump allocator.
    pub heap_size: u64,
    /// Load base for the dynamic linker.
    pub interp_base: u64,
    /// Size of the initial stack mapping.
    pub stack_size: u64,
    /// Guest environment.
    pub env: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            heap_size: 64 << 20,
            interp_base: 0x1800_0000,
            stack_size: 8 << 20,
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
                "HOME=/root".to_owned(),
                "USER=root".to_owned(),
                "TERM=xterm-256color".to_owned(),
                "LANG=C.UTF-8".to_owned(),
                "HOSTNAME=friscy".to_owned(),
            ],
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LauncherError {
    #[error("no guest loaded")]
    NoGuest,
    #[error("entry not found in rootfs: {0}")]
    EntryNotFound(String),
    #[error("interpreter not found in rootfs: {0}")]
    InterpreterNotFound(String),
    #[error(transparent)]
    Tar(#[from] friscy::fs::tar::TarError),
    #[error("entry is not a loadable ELF: {0}")]
    Elf(#[from] friscy_shim_linux::loader::ElfLoaderError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Snapshot(#[from] snapshot::SnapshotError),
}

/// The machine and its runtime, owned together so the execution thread and the
/// host-side snapshot calls serialize on one lock.
pub struct Guest {
    pub machine: Box<dyn Machine>,
    pub runtime: Runtime,
}

struct Session {
    guest: Arc<Mutex<Guest>>,
    stop: StopRequester,
    output: OutputFn,
    worker: Option<JoinHandle<()>>,
}

/// Public entry points for the host binding.
pub struct Launcher {
    io: Arc<HostIo>,
    options: RuntimeOptions,
    session: Option<Session>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(RuntimeOptions::default())
    }
}

impl Launcher {
    /// Initialize the launcher. One per process is expected.
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            io: Arc::new(HostIo::new()),
            options,
            session: None,
        }
    }

    pub fn version() -> &'static str {
        VERSION
    }

    /// Build the VFS from `tar_data`, load `entry_path` (following symlinks) into the
    /// provided machine, install the shim state, and lay out the initial stack. The
    /// guest does not run until [`Self::start`].
    pub fn load_rootfs(
        &mut self,
        mut machine: Box<dyn Machine>,
        tar_data: &[u8],
        entry_path: &str,
        on_output: OutputFn,
    ) -> Result<(), LauncherError> {
        self.io.reset();

        let vfs = VirtualFs::from_tar(tar_data)?;
        let binary = vfs
            .read_file(entry_path)
            .map_err(|_| LauncherError::EntryNotFound(entry_path.to_owned()))?;
        let mut exec_info = parse_elf(&binary)?;
        log::info!(
            "entry {entry_path}: {} bytes, dynamic: {}",
            binary.len(),
            exec_info.is_dynamic
        );

        let interp_binary = if exec_info.is_dynamic {
            vfs.read_file(&exec_info.interpreter).map_err(|_| {
                LauncherError::InterpreterNotFound(exec_info.interpreter.clone())
            })?
        } else {
            Vec::new()
        };

        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        let sink_output = Arc::clone(&on_output);
        let sink = Box::new(move |bytes: &[u8]| {
            sink_output(&String::from_utf8_lossy(bytes));
        });
        let mut rt = Runtime::new(vfs, Arc::clone(&self.io), sink, seed);
        rt.exec.env.clone_from(&self.options.env);

        let m = machine.as_mut();

        // Load the entry binary: PIE binaries at the standard base, fixed binaries at
        // their linked addresses.
        let requested_base = if exec_info.kind == ElfKind::Dyn {
            ENTRY_PIE_BASE
        } else {
            0
        };
        let base_adjust = load_segments(m, &binary, requested_base)?;
        exec_info.entry_point += base_adjust;
        exec_info.phdr_addr += base_adjust;
        exec_info.base_addr = base_adjust;
        let (rw_lo, rw_hi) = get_writable_range(&binary);
        rt.exec.exec_base = base_adjust;
        if rw_lo != u64::MAX {
            rt.exec.exec_rw_start = base_adjust + rw_lo;
            rt.exec.exec_rw_end = base_adjust + rw_hi;
        }

        // The interpreter goes to its fixed slot in the arena; entry moves with it.
        let mut entry = exec_info.entry_point;
        if exec_info.is_dynamic {
            let interp_base = self.options.interp_base;
            load_segments(m, &interp_binary, interp_base)?;
            let interp_info = parse_elf(&interp_binary)?;
            let (ilo, _ihi) = get_load_range(&interp_binary);
            let interp_entry = if interp_info.kind == ElfKind::Dyn {
                interp_info.entry_point - ilo + interp_base
            } else {
                interp_info.entry_point
            };
            let (irw_lo, irw_hi) = get_writable_range(&interp_binary);
            rt.exec.interp_base = interp_base;
            if irw_lo != u64::MAX {
                rt.exec.interp_rw_start = interp_base + irw_lo - ilo;
                rt.exec.interp_rw_end = interp_base + irw_hi - ilo;
            }
            rt.exec.interp_entry = interp_entry;
            rt.exec.interp_binary = interp_binary;
            rt.exec.dynamic = true;
            entry = interp_entry;
            log::info!("interpreter {} at {interp_base:#x}", exec_info.interpreter);
        }

        // Native heap for the machine's bump allocator; guest mmaps land above it.
        let heap_start = m.mmap_allocate(self.options.heap_size);
        rt.exec.heap_start = heap_start;
        rt.exec.heap_size = self.options.heap_size;
        rt.exec.mmap_frontier = m.mmap_frontier();

        // Initial stack just below the top of the arena.
        let stack_top = (m.arena_size() - 0x1_0000) & !15;
        let stack_bottom = stack_top.saturating_sub(self.options.stack_size) & PAGE_MASK;
        m.set_page_attributes(stack_bottom, stack_top - stack_bottom, PageAttributes::RW);
        rt.exec.original_stack_top = stack_top;

        let args = vec![entry_path.to_owned()];
        let env = rt.exec.env.clone();
        let sp = stack::build_initial_stack(
            m,
            &exec_info,
            rt.exec.interp_base,
            &args,
            &env,
            &mut rt.rng,
            stack_top,
        )?;
        m.set_reg(reg::SP, sp);
        m.set_pc(entry);

        rt.exec.exec_binary = binary;
        rt.exec.exec_info = exec_info;

        on_output(&format!(
            "[friscy] Loaded {entry_path} ({} bytes)\r\n",
            rt.exec.exec_binary.len()
        ));

        let stop = m.stop_requester();
        self.session = Some(Session {
            guest: Arc::new(Mutex::new(Guest { machine, runtime: rt })),
            stop,
            output: on_output,
            worker: None,
        });
        Ok(())
    }

    /// Launch the execution thread.
    pub fn start(&mut self) -> Result<(), LauncherError> {
        if self.session.is_none() {
            return Err(LauncherError::NoGuest);
        }
        if self.io.is_running() {
            return Ok(());
        }
        let io = Arc::clone(&self.io);
        io.set_running(true);
        io.set_waiting_for_stdin(false);

        let session = self.session.as_mut().expect("checked above");
        if let Some(worker) = session.worker.take() {
            let _ = worker.join();
        }
        session.stop.clear();

        let guest = Arc::clone(&session.guest);
        let output = Arc::clone(&session.output);
        session.worker = Some(std::thread::spawn(move || {
            execution_loop(&guest, &io, &output);
        }));
        Ok(())
    }

    /// Push UTF-8 input to the guest's stdin.
    pub fn send_input(&self, text: &str) {
        self.io.push_stdin(text.as_bytes());
    }

    /// Signal shutdown and join the execution thread.
    pub fn stop(&mut self) {
        self.io.set_running(false);
        if let Some(session) = self.session.as_mut() {
            session.stop.request();
            if let Some(worker) = session.worker.take() {
                let _ = worker.join();
            }
        }
    }

    /// Stop and free all per-session resources.
    pub fn destroy(&mut self) {
        self.stop();
        self.session = None;
        self.io.reset();
    }

    pub fn is_running(&self) -> bool {
        self.io.is_running()
    }

    /// Update the dimensions reported through `TIOCGWINSZ`.
    pub fn set_terminal_size(&self, cols: u16, rows: u16) {
        self.io.set_terminal_size(cols, rows);
    }

    /// Write a whole-machine snapshot. Blocks until the execution thread is between
    /// run episodes (or parked on stdin).
    pub fn save_snapshot(&self, path: &Path) -> Result<(), LauncherError> {
        let session = self.session.as_ref().ok_or(LauncherError::NoGuest)?;
        let guest = session.guest.lock().unwrap();
        snapshot::save(guest.machine.as_ref(), path)?;
        Ok(())
    }

    /// Restore a whole-machine snapshot into the loaded guest.
    pub fn restore_snapshot(&self, path: &Path) -> Result<(), LauncherError> {
        let session = self.session.as_ref().ok_or(LauncherError::NoGuest)?;
        let mut guest = session.guest.lock().unwrap();
        snapshot::restore(guest.machine.as_mut(), path)?;
        Ok(())
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum RunEpisode {
    Stopped,
    Fatal(MachineError),
}

/// One run episode: execute until the machine stops, dispatching ecalls and repairing
/// recoverable page faults along the way.
fn run_episode(guest: &mut Guest) -> RunEpisode {
    let m = guest.machine.as_mut();
    let mut repairs = 0u32;
    loop {
        if m.stop_requested() {
            return RunEpisode::Stopped;
        }
        match m.run(MAX_INSTRUCTIONS) {
            Ok(StopReason::Ecall) => handle_ecall(&mut guest.runtime, m),
            Ok(StopReason::Stopped) => return RunEpisode::Stopped,
            Ok(StopReason::InstructionLimit) => {}
            Err(MachineError::PageFault { addr }) if repairs < MAX_FAULT_REPAIRS => {
                repairs += 1;
                log::debug!("repairing page fault at {addr:#x} (attempt {repairs})");
                m.set_page_attributes(addr & PAGE_MASK, PAGE_SIZE, PageAttributes::RWX);
            }
            Err(e) => return RunEpisode::Fatal(e),
        }
    }
}

fn execution_loop(guest: &Arc<Mutex<Guest>>, io: &Arc<HostIo>, output: &OutputFn) {
    log::info!("execution thread started");
    while io.is_running() {
        let episode = {
            let mut guard = guest.lock().unwrap();
            let episode = run_episode(&mut guard);
            guard.machine.clear_stop();
            episode
        };

        match episode {
            RunEpisode::Fatal(e) => {
                log::error!("unrecoverable machine fault: {e}");
                output(&format!("\r\n\x1b[31m[friscy error] {e}\x1b[0m\r\n"));
                break;
            }
            RunEpisode::Stopped => {
                if !io.is_running() {
                    log::info!("execution thread: stop signal received");
                    break;
                }
                if io.take_waiting_for_stdin() {
                    // The guest rewound a blocked read; park until the host supplies
                    // input (or shuts down), then re-enter the ecall.
                    io.wait_for_stdin();
                    continue;
                }
                // Voluntary exit.
                let code = {
                    let guard = guest.lock().unwrap();
                    guard
                        .runtime
                        .exit_code
                        .unwrap_or(guard.machine.reg(reg::A0) as i32)
                };
                log::info!("guest exited with code {code}");
                output(&format!("\r\n[friscy] Program exited with code: {code}\r\n"));
                break;
            }
        }
    }
    io.set_running(false);
    log::info!("execution thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy::machine::mock::MockMachine;
    use friscy_common_linux::nr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// A minimal static RV64 ELF with one RX text segment.
    fn tiny_static_elf(entry: u64) -> Vec<u8> {
        let mut image = vec![0u8; 0x1000 + 0x100];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2;
        image[5] = 1;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&0xf3u16.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        image[52..54].copy_from_slice(&64u16.to_le_bytes());
        image[54..56].copy_from_slice(&56u16.to_le_bytes());
        image[56..58].copy_from_slice(&1u16.to_le_bytes());
        // One PT_LOAD: offset 0x1000, vaddr = entry page, 0x100 bytes, R+X.
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&0x1000u64.to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&(entry & !0xfff).to_le_bytes());
        image[ph + 24..ph + 32].copy_from_slice(&(entry & !0xfff).to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&0x100u64.to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&0x100u64.to_le_bytes());
        image[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        image
    }

    fn rootfs_tar() -> Vec<u8> {
        let mut vfs = VirtualFs::new();
        vfs.add_file("/bin/hello", &tiny_static_elf(0x1_0000));
        vfs.symlink("/bin/hello", "/bin/sh").unwrap();
        vfs.save_tar()
    }

    fn collecting_output() -> (OutputFn, Arc<StdMutex<String>>) {
        let collected = Arc::new(StdMutex::new(String::new()));
        let sink = {
            let collected = Arc::clone(&collected);
            Arc::new(move |s: &str| collected.lock().unwrap().push_str(s)) as OutputFn
        };
        (sink, collected)
    }

    fn wait_until_stopped(launcher: &Launcher) {
        for _ in 0..200 {
            if !launcher.is_running() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("execution thread did not finish");
    }

    #[test]
    fn load_rootfs_resolves_symlink_entry_and_builds_the_stack() {
        let mut launcher = Launcher::default();
        let (sink, collected) = collecting_output();
        let machine = Box::new(MockMachine::new(1 << 26));
        launcher
            .load_rootfs(machine, &rootfs_tar(), "/bin/sh", sink)
            .unwrap();
        assert!(collected.lock().unwrap().contains("[friscy] Loaded /bin/sh"));

        let session = launcher.session.as_ref().unwrap();
        let guest = session.guest.lock().unwrap();
        // Static entry: control starts at the binary's entry point.
        assert_eq!(guest.machine.pc(), 0x1_0000);
        let sp = guest.machine.reg(reg::SP);
        assert_eq!(sp % 16, 0);
        // argc == 1, argv[0] == the entry path.
        let m: &dyn Machine = guest.machine.as_ref();
        assert_eq!(m.read_u64(sp).unwrap(), 1);
        let argv0 = m.read_u64(sp + 8).unwrap();
        assert_eq!(m.read_cstring(argv0, 64).unwrap(), "/bin/sh");
    }

    #[test]
    fn missing_entry_is_reported() {
        let mut launcher = Launcher::default();
        let (sink, _) = collecting_output();
        let machine = Box::new(MockMachine::new(1 << 26));
        let err = launcher
            .load_rootfs(machine, &rootfs_tar(), "/bin/nosuch", sink)
            .unwrap_err();
        assert!(matches!(err, LauncherError::EntryNotFound(_)));
    }

    #[test]
    fn stdin_rendezvous_suspends_and_resumes() {
        let mut launcher = Launcher::default();
        let (sink, collected) = collecting_output();

        let mut machine = MockMachine::new(1 << 26);
        // Script: the guest issues read(0, buf, 10) twice (the rewound ecall
        // re-executes), then exits.
        machine.push_run_result(StopReason::Ecall);
        machine.push_run_result(StopReason::Ecall);
        launcher
            .load_rootfs(Box::new(machine), &rootfs_tar(), "/bin/hello", sink)
            .unwrap();

        {
            let session = launcher.session.as_ref().unwrap();
            let mut guest = session.guest.lock().unwrap();
            let m = guest.machine.as_mut();
            m.set_reg(reg::A7, nr::READ);
            m.set_reg(reg::A0, 0);
            m.set_reg(reg::A1, 0x20_0000);
            m.set_reg(reg::A2, 10);
        }

        launcher.start().unwrap();
        // The first read finds no input: the thread suspends, still running.
        std::thread::sleep(Duration::from_millis(50));
        assert!(launcher.is_running());

        launcher.send_input("x\n");
        wait_until_stopped(&launcher);

        let out = collected.lock().unwrap().clone();
        assert!(out.contains("Program exited with code: 2"), "output: {out}");
        // The re-executed read drained the queue into guest memory.
        let session = launcher.session.as_ref().unwrap();
        let guest = session.guest.lock().unwrap();
        let m: &dyn Machine = guest.machine.as_ref();
        let mut buf = [0u8; 2];
        m.read_mem(0x20_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"x\n");
    }

    #[test]
    fn stop_wakes_a_parked_guest() {
        let mut launcher = Launcher::default();
        let (sink, _collected) = collecting_output();
        let mut machine = MockMachine::new(1 << 26);
        machine.push_run_result(StopReason::Ecall);
        launcher
            .load_rootfs(Box::new(machine), &rootfs_tar(), "/bin/hello", sink)
            .unwrap();
        {
            let session = launcher.session.as_ref().unwrap();
            let mut guest = session.guest.lock().unwrap();
            let m = guest.machine.as_mut();
            m.set_reg(reg::A7, nr::READ);
            m.set_reg(reg::A0, 0);
            m.set_reg(reg::A1, 0x20_0000);
            m.set_reg(reg::A2, 10);
        }
        launcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(launcher.is_running());

        launcher.stop();
        assert!(!launcher.is_running());
    }

    #[test]
    fn fault_repair_promotes_the_page() {
        let mut launcher = Launcher::default();
        let (sink, collected) = collecting_output();
        let mut machine = MockMachine::new(1 << 26);
        machine.push_run_fault(0x5_0000);
        launcher
            .load_rootfs(Box::new(machine), &rootfs_tar(), "/bin/hello", sink)
            .unwrap();
        launcher.start().unwrap();
        wait_until_stopped(&launcher);

        let session = launcher.session.as_ref().unwrap();
        let guest = session.guest.lock().unwrap();
        let attr = guest.machine.page_attributes(0x5_0000);
        assert!(attr.read && attr.write && attr.exec);
        assert!(collected.lock().unwrap().contains("Program exited"));
    }

    #[test]
    fn exit_banner_carries_the_guest_code() {
        let mut launcher = Launcher::default();
        let (sink, collected) = collecting_output();
        let mut machine = MockMachine::new(1 << 26);
        machine.push_run_result(StopReason::Ecall);
        launcher
            .load_rootfs(Box::new(machine), &rootfs_tar(), "/bin/hello", sink)
            .unwrap();
        {
            let session = launcher.session.as_ref().unwrap();
            let mut guest = session.guest.lock().unwrap();
            let m = guest.machine.as_mut();
            m.set_reg(reg::A7, nr::EXIT_GROUP);
            m.set_reg(reg::A0, 7);
        }
        launcher.start().unwrap();
        wait_until_stopped(&launcher);
        assert!(collected
            .lock()
            .unwrap()
            .contains("Program exited with code: 7"));
    }

    #[test]
    fn snapshot_round_trip_through_the_launcher() {
        let dir = std::env::temp_dir().join("friscy-launcher-snap");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("guest.snap");

        let mut launcher = Launcher::default();
        let (sink, _) = collecting_output();
        launcher
            .load_rootfs(
                Box::new(MockMachine::new(1 << 20)),
                &rootfs_tar(),
                "/bin/hello",
                sink,
            )
            .unwrap();
        launcher.save_snapshot(&path).unwrap();

        // Scribble over a register, then restore.
        {
            let session = launcher.session.as_ref().unwrap();
            let mut guest = session.guest.lock().unwrap();
            guest.machine.set_reg(reg::SP, 0);
        }
        launcher.restore_snapshot(&path).unwrap();
        let session = launcher.session.as_ref().unwrap();
        let guest = session.guest.lock().unwrap();
        assert_ne!(guest.machine.reg(reg::SP), 0);
        drop(guest);
        std::fs::remove_file(&path).unwrap();
    }
}
