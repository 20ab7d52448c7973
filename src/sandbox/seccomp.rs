use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/**
 * Parent-side seccomp configuration.
 *
 * Namespaces and the overlay already bound what the sandboxed process can
 * see; the filter only has to deny kernel-level escape hatches, so it is a
 * blocklist over syscalls plus an argument filter on socket(2) protocol
 * families. Everything else stays allowed.
 */
#[derive(Debug, Clone)]
pub struct SeccompConfig {
    pub enabled: bool,
    /* Syscall names to deny; None selects the default blocklist. */
    pub blocked_syscalls: Option<Vec<String>>,
    /* AF_* families to deny on socket(2); None selects the default list. */
    pub blocked_socket_families: Option<Vec<i32>>,
    /* Log denied syscalls instead of killing the process (debugging). */
    pub log_denied: bool,
}

impl Default for SeccompConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_syscalls: None,
            blocked_socket_families: None,
            log_denied: false,
        }
    }
}

impl SeccompConfig {
    /**
     * Resolves syscall names to numbers and produces the message for the
     * config pipe. Unknown names error here, on the parent side, so the
     * child never needs a symbol table. None when the filter is disabled
     * or would have nothing to deny.
     */
    pub fn init_spec(&self) -> Result<Option<SeccompSpec>> {
        if !self.enabled {
            return Ok(None);
        }

        let numbers = match &self.blocked_syscalls {
            Some(names) => resolve_blocklist(names)?,
            None => resolve_blocklist(DEFAULT_BLOCKED_SYSCALLS)?,
        };
        let families = match &self.blocked_socket_families {
            Some(families) => families.clone(),
            None => default_blocked_socket_families(),
        };

        if numbers.is_empty() && families.is_empty() {
            return Ok(None);
        }

        Ok(Some(SeccompSpec {
            blocked_syscalls: numbers,
            blocked_socket_families: families,
            log_denied: self.log_denied,
        }))
    }
}

/**
 * The resolved filter sent over the config pipe: sorted, deduplicated
 * syscall numbers for the target architecture.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeccompSpec {
    pub blocked_syscalls: Vec<i64>,
    #[serde(default)]
    pub blocked_socket_families: Vec<i32>,
    #[serde(default)]
    pub log_denied: bool,
}

/* Syscalls that grant kernel-level privilege, reconfigure the isolation
 * the init pipeline just built, tamper with system state, or bypass the
 * namespace boundaries for introspection. Everything here is something the
 * init pipeline either never needs or has already finished doing by the
 * time the filter loads. */
#[cfg(target_arch = "x86_64")]
pub const DEFAULT_BLOCKED_SYSCALLS: &[&str] = &[
    /* process debugging/injection */
    "ptrace",
    /* filesystem mounts (init is done with them) */
    "mount",
    "umount2",
    /* root switching (init is done with it) */
    "pivot_root",
    "chroot",
    /* system control */
    "reboot",
    "swapon",
    "swapoff",
    "acct",
    /* kernel modules */
    "init_module",
    "finit_module",
    "delete_module",
    "create_module",
    /* kernel replacement */
    "kexec_load",
    "kexec_file_load",
    /* namespace manipulation */
    "setns",
    "unshare",
    /* kernel keyring */
    "keyctl",
    "request_key",
    "add_key",
    /* BPF program loading */
    "bpf",
    /* exploitable kernel interfaces */
    "userfaultfd",
    "perf_event_open",
    "lookup_dcookie",
    /* file handles bypass DAC permission checks */
    "open_by_handle_at",
    "name_to_handle_at",
    /* system clock */
    "clock_settime",
    "settimeofday",
    "adjtimex",
    "clock_adjtime",
    /* raw I/O port access */
    "ioperm",
    "iopl",
    /* filesystem-wide monitoring */
    "fanotify_init",
    /* virtual terminal */
    "vhangup",
    /* NFS administration */
    "nfsservctl",
];

/* create_module, ioperm and iopl do not exist in the arm64 syscall table */
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_BLOCKED_SYSCALLS: &[&str] = &[
    "ptrace",
    "mount",
    "umount2",
    "pivot_root",
    "chroot",
    "reboot",
    "swapon",
    "swapoff",
    "acct",
    "init_module",
    "finit_module",
    "delete_module",
    "kexec_load",
    "kexec_file_load",
    "setns",
    "unshare",
    "keyctl",
    "request_key",
    "add_key",
    "bpf",
    "userfaultfd",
    "perf_event_open",
    "lookup_dcookie",
    "open_by_handle_at",
    "name_to_handle_at",
    "clock_settime",
    "settimeofday",
    "adjtimex",
    "clock_adjtime",
    "fanotify_init",
    "vhangup",
    "nfsservctl",
];

/* Families for kernel communication, raw packet access and hardware
 * control. AF_UNIX(1), AF_INET(2) and AF_INET6(10) stay usable. */
pub fn default_blocked_socket_families() -> Vec<i32> {
    vec![
        libc::AF_NETLINK,   /* 16 - kernel messaging and net configuration */
        libc::AF_PACKET,    /* 17 - raw packet capture and injection */
        libc::AF_BLUETOOTH, /* 31 - hardware access */
        libc::AF_KEY,       /* 15 - IPsec key management */
        libc::AF_ALG,       /* 38 - kernel crypto API */
        libc::AF_VSOCK,     /* 40 - VM/host channel */
        libc::AF_XDP,       /* 44 - raw XDP packet access */
    ]
}

#[cfg(target_arch = "x86_64")]
const SYSCALL_TABLE: &[(&str, libc::c_long)] = &[
    ("ptrace", libc::SYS_ptrace),
    ("mount", libc::SYS_mount),
    ("umount2", libc::SYS_umount2),
    ("pivot_root", libc::SYS_pivot_root),
    ("chroot", libc::SYS_chroot),
    ("reboot", libc::SYS_reboot),
    ("swapon", libc::SYS_swapon),
    ("swapoff", libc::SYS_swapoff),
    ("acct", libc::SYS_acct),
    ("init_module", libc::SYS_init_module),
    ("finit_module", libc::SYS_finit_module),
    ("delete_module", libc::SYS_delete_module),
    ("create_module", libc::SYS_create_module),
    ("kexec_load", libc::SYS_kexec_load),
    ("kexec_file_load", libc::SYS_kexec_file_load),
    ("setns", libc::SYS_setns),
    ("unshare", libc::SYS_unshare),
    ("keyctl", libc::SYS_keyctl),
    ("request_key", libc::SYS_request_key),
    ("add_key", libc::SYS_add_key),
    ("bpf", libc::SYS_bpf),
    ("userfaultfd", libc::SYS_userfaultfd),
    ("perf_event_open", libc::SYS_perf_event_open),
    ("lookup_dcookie", libc::SYS_lookup_dcookie),
    ("open_by_handle_at", libc::SYS_open_by_handle_at),
    ("name_to_handle_at", libc::SYS_name_to_handle_at),
    ("clock_settime", libc::SYS_clock_settime),
    ("settimeofday", libc::SYS_settimeofday),
    ("adjtimex", libc::SYS_adjtimex),
    ("clock_adjtime", libc::SYS_clock_adjtime),
    ("ioperm", libc::SYS_ioperm),
    ("iopl", libc::SYS_iopl),
    ("fanotify_init", libc::SYS_fanotify_init),
    ("vhangup", libc::SYS_vhangup),
    ("nfsservctl", libc::SYS_nfsservctl),
];

#[cfg(target_arch = "aarch64")]
const SYSCALL_TABLE: &[(&str, libc::c_long)] = &[
    ("ptrace", libc::SYS_ptrace),
    ("mount", libc::SYS_mount),
    ("umount2", libc::SYS_umount2),
    ("pivot_root", libc::SYS_pivot_root),
    ("chroot", libc::SYS_chroot),
    ("reboot", libc::SYS_reboot),
    ("swapon", libc::SYS_swapon),
    ("swapoff", libc::SYS_swapoff),
    ("acct", libc::SYS_acct),
    ("init_module", libc::SYS_init_module),
    ("finit_module", libc::SYS_finit_module),
    ("delete_module", libc::SYS_delete_module),
    ("kexec_load", libc::SYS_kexec_load),
    ("kexec_file_load", libc::SYS_kexec_file_load),
    ("setns", libc::SYS_setns),
    ("unshare", libc::SYS_unshare),
    ("keyctl", libc::SYS_keyctl),
    ("request_key", libc::SYS_request_key),
    ("add_key", libc::SYS_add_key),
    ("bpf", libc::SYS_bpf),
    ("userfaultfd", libc::SYS_userfaultfd),
    ("perf_event_open", libc::SYS_perf_event_open),
    ("lookup_dcookie", libc::SYS_lookup_dcookie),
    ("open_by_handle_at", libc::SYS_open_by_handle_at),
    ("name_to_handle_at", libc::SYS_name_to_handle_at),
    ("clock_settime", libc::SYS_clock_settime),
    ("settimeofday", libc::SYS_settimeofday),
    ("adjtimex", libc::SYS_adjtimex),
    ("clock_adjtime", libc::SYS_clock_adjtime),
    ("fanotify_init", libc::SYS_fanotify_init),
    ("vhangup", libc::SYS_vhangup),
    ("nfsservctl", libc::SYS_nfsservctl),
];

fn syscall_number(name: &str) -> Option<libc::c_long> {
    SYSCALL_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nr)| *nr)
}

/**
 * Resolves syscall names to a sorted, deduplicated list of numbers for the
 * target architecture. Fails on the first unknown name.
 */
pub fn resolve_blocklist<S: AsRef<str>>(names: &[S]) -> Result<Vec<i64>> {
    let mut numbers: Vec<i64> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let nr = syscall_number(name)
            .ok_or_else(|| anyhow!("unknown syscall: \"{}\"", name))?
            as i64;
        if !numbers.contains(&nr) {
            numbers.push(nr);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/* Offsets into struct seccomp_data, the buffer every BPF load reads:
 *
 *   struct seccomp_data {
 *       int   nr;                    // offset 0
 *       __u32 arch;                  // offset 4
 *       __u64 instruction_pointer;   // offset 8
 *       __u64 args[6];               // offset 16, 24, 32, ...
 *   };
 */
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_ARGS0_OFFSET: u32 = 16; /* low 32 bits, little-endian */

/* BPF instruction classes */
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

/* seccomp filter return values */
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const SECCOMP_SET_MODE_FILTER: libc::c_long = 1;

/* AUDIT_ARCH_* = EM_<arch> | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE */
#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xC000_003E; /* AUDIT_ARCH_X86_64 */
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xC000_00B7; /* AUDIT_ARCH_AARCH64 */

/* One classic-BPF instruction, layout-compatible with struct sock_filter */
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

fn bpf_stmt(code: u16, k: u32) -> SockFilter {
    SockFilter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/*
 * Program layout (blocklist + socket argument filter):
 *
 *   Section A: architecture check
 *     [0] load arch
 *     [1] jeq AUDIT_ARCH_<target> -> next, else -> [2]
 *     [2] ret KILL_PROCESS
 *     [3] load syscall nr
 *
 *   Section B: socket() redirect (only with blocked families)
 *     [4] jeq SYS_socket -> Section E
 *
 *   Section C: blocked syscall ladder
 *     [..] jeq blocked[i] -> Section F
 *
 *   Section D: default allow
 *     [..] ret ALLOW
 *
 *   Section E: socket family ladder (checks args[0])
 *     [..] load args[0]
 *     [..] jeq family[j] -> Section F
 *     [..] ret ALLOW
 *
 *   Section F: deny action
 *     [..] ret KILL_PROCESS (or LOG)
 *
 * All jump offsets are relative to the next instruction; the section sizes
 * below keep them in one place.
 */
fn build_bpf_program(
    blocked_nrs: &[i64],
    blocked_families: &[i32],
    log_denied: bool,
) -> Vec<SockFilter> {
    let deny_action = if log_denied {
        SECCOMP_RET_LOG
    } else {
        SECCOMP_RET_KILL_PROCESS
    };

    let has_socket_filter = !blocked_families.is_empty();
    let num_blocked = blocked_nrs.len();
    let num_families = blocked_families.len();

    let size_b = usize::from(has_socket_filter);
    let size_e = if has_socket_filter {
        1 + num_families + 1 /* load + jeq ladder + ret ALLOW */
    } else {
        0
    };

    /* Index of the single deny instruction (Section F) */
    let kill_idx = 4 + size_b + num_blocked + 1 + size_e;

    let mut program = Vec::with_capacity(kill_idx + 1);

    /* --- Section A --- */
    program.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET));
    program.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_CURRENT, 1, 0));
    /* A foreign ABI is terminated unconditionally, log_denied or not */
    program.push(bpf_stmt(BPF_RET, SECCOMP_RET_KILL_PROCESS));
    program.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET));

    /* --- Section B --- */
    if has_socket_filter {
        /* Section E starts at 4 + 1 + num_blocked + 1 */
        let jt = (num_blocked + 1) as u8;
        program.push(bpf_jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            libc::SYS_socket as u32,
            jt,
            0,
        ));
    }

    /* --- Section C --- */
    for (i, nr) in blocked_nrs.iter().enumerate() {
        let current_idx = 4 + size_b + i;
        let jt = (kill_idx - current_idx - 1) as u8;
        program.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, *nr as u32, jt, 0));
    }

    /* --- Section D --- */
    program.push(bpf_stmt(BPF_RET, SECCOMP_RET_ALLOW));

    /* --- Section E --- */
    if has_socket_filter {
        program.push(bpf_stmt(
            BPF_LD | BPF_W | BPF_ABS,
            SECCOMP_DATA_ARGS0_OFFSET,
        ));
        for (j, family) in blocked_families.iter().enumerate() {
            let jt = (num_families - j) as u8;
            program.push(bpf_jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                *family as u32,
                jt,
                0,
            ));
        }
        program.push(bpf_stmt(BPF_RET, SECCOMP_RET_ALLOW));
    }

    /* --- Section F --- */
    program.push(bpf_stmt(BPF_RET, deny_action));

    program
}

/**
 * Installs the filter on the calling process. Must be the last init step
 * before exec: once loaded, the filter applies to init itself, and the
 * pipeline's own mount/pivot/sethostname calls would be denied.
 *
 * `PR_SET_NO_NEW_PRIVS` comes first; it is required to load a filter
 * without CAP_SYS_ADMIN and closes the setuid-escalation hole.
 */
pub fn apply_seccomp(spec: &SeccompSpec) -> Result<()> {
    if spec.blocked_syscalls.is_empty()
        && spec.blocked_socket_families.is_empty()
    {
        return Ok(());
    }

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(anyhow!(
            "prctl(PR_SET_NO_NEW_PRIVS): {}",
            std::io::Error::last_os_error()
        ));
    }

    let program = build_bpf_program(
        &spec.blocked_syscalls,
        &spec.blocked_socket_families,
        spec.log_denied,
    );
    let fprog = SockFprog {
        len: program.len() as u16,
        filter: program.as_ptr(),
    };

    let result = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_long,
            &fprog as *const SockFprog,
        )
    };
    if result != 0 {
        return Err(anyhow!(
            "seccomp(SECCOMP_SET_MODE_FILTER): {}",
            std::io::Error::last_os_error()
        ));
    }

    Ok(())
}
