//! Priority and CPU pinning helpers for the execution-loop thread.
//!
//! Both helpers are best effort: real-time policies and affinity changes usually need extra
//! privileges, and a refused request only costs timing precision, so failures are logged at
//! `debug` and otherwise ignored.

use tracing::debug;

/// Raise (or lower) the scheduling priority of the calling thread.
///
/// # Platform-Specific Behavior
///
/// ## Linux
/// - `priority >= 3`: `SCHED_FIFO` 90
/// - `priority == 2`: `SCHED_FIFO` 70
/// - `priority == 1`: `SCHED_RR` 30
/// - otherwise: `SCHED_OTHER`
///
/// ## macOS
/// Mapped onto QoS classes (user-initiated, utility, background).
///
/// ## Other Platforms
/// No-op.
///
/// Returns true when the request was accepted.
pub fn set_thread_priority(priority: i32) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };

        let (policy, sched_priority) = match priority {
            p if p >= 3 => (SCHED_FIFO, 90),
            2 => (SCHED_FIFO, 70),
            1 => (SCHED_RR, 30),
            _ => (SCHED_OTHER, 0),
        };

        let rc = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if rc != 0 {
            debug!(priority, errno = rc, "thread priority request refused");
        }
        rc == 0
    }
    #[cfg(target_os = "macos")]
    {
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x15;
        const QOS_CLASS_BACKGROUND: u32 = 0x09;

        let qos_class = match priority {
            p if p >= 2 => QOS_CLASS_USER_INITIATED,
            1 => QOS_CLASS_UTILITY,
            _ => QOS_CLASS_BACKGROUND,
        };

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }
        let rc = unsafe { pthread_set_qos_class_self_np(qos_class, 0) };
        if rc != 0 {
            debug!(priority, errno = rc, "thread QoS request refused");
        }
        rc == 0
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        debug!(priority, "thread priority not supported on this platform");
        false
    }
}

/// Pin the calling thread to `core_id`.
///
/// Linux only; a no-op returning false elsewhere.
pub fn set_thread_core(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if core_id >= CPU_SETSIZE as usize {
            debug!(core_id, "core id outside cpu_set_t range");
            return false;
        }
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            debug!(core_id, errno = rc, "thread affinity request refused");
        }
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!(core_id, "thread pinning not supported on this platform");
        false
    }
}

/// Apply the optional priority and core settings of the loop thread.
pub(crate) fn tune_current_thread(priority: Option<i32>, core: Option<usize>) {
    if let Some(priority) = priority {
        set_thread_priority(priority);
    }
    if let Some(core) = core {
        set_thread_core(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_is_always_allowed_on_linux() {
        let accepted = set_thread_priority(0);
        if cfg!(target_os = "linux") {
            assert!(accepted);
        }
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        assert!(!set_thread_core(usize::MAX));
    }
}
