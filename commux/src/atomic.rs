//! Atomic resource selection.
//!
//! Decides which transport resources carry one-sided atomic operations:
//! every CPU-atomics interface, the best device-atomics interface and its
//! device siblings, or a guess between the two. Runs once per worker, at
//! create time, when the context requests atomic features.

use tracing::{debug, trace};

use crate::caps::{AtomicMode, Features, IfaceAttr, IfaceFlags, MdAttr, TlResource};

/// Operand size the device score is computed for.
const AMO_SIZE: f64 = 8.0;

/// Everything the selector consults, dense over `rsc_index`.
pub(crate) struct AtomicSelectInput<'a> {
    pub features: Features,
    pub mode: AtomicMode,
    pub rscs: &'a [TlResource],
    pub mds: &'a [MdAttr],
    pub attrs: &'a [IfaceAttr],
}

/// Compute the `atomic_tls` bitmask over `rsc_index`.
pub(crate) fn select_atomic_tls(input: &AtomicSelectInput<'_>) -> u64 {
    if !input
        .features
        .intersects(Features::AMO32 | Features::AMO64)
    {
        return 0;
    }

    match input.mode {
        AtomicMode::Cpu => init_cpu_atomics(input),
        AtomicMode::Device => init_device_atomics(input),
        AtomicMode::Guess => init_guess_atomics(input),
    }
}

/// Enable every interface with host-based atomics.
fn init_cpu_atomics(input: &AtomicSelectInput<'_>) -> u64 {
    let mut atomic_tls = 0u64;
    for (rsc_index, attr) in input.attrs.iter().enumerate() {
        if attr.flags.contains(IfaceFlags::ATOMIC_CPU) {
            enable_atomic_tl(&mut atomic_tls, "cpu", rsc_index, input);
        }
    }
    atomic_tls
}

/// Pick the best device-atomics interface, then enable every interface on
/// the same memory domain and device.
fn init_device_atomics(input: &AtomicSelectInput<'_>) -> u64 {
    let required = IfaceFlags::atomic_set_for(input.features) | IfaceFlags::ATOMIC_DEVICE;

    // The virtual ideal the wire-up score compares against: infinite
    // bandwidth, zero overhead, zero priority.
    let ideal = IfaceAttr {
        bandwidth: 1e12,
        overhead: 0.0,
        latency: 0.0,
        priority: 0,
        flags: IfaceFlags::all(),
        ..Default::default()
    };

    let mut supp_tls = 0u64;
    let mut best: Option<(usize, f64, u8)> = None;

    for (rsc_index, attr) in input.attrs.iter().enumerate() {
        let md = &input.mds[input.rscs[rsc_index].md_index];
        if !md.supports_reg || !attr.flags.contains(required) {
            continue;
        }

        supp_tls |= 1u64 << rsc_index;
        let score = amo_score(attr, &ideal);
        trace!(rsc_index, score, "device atomics candidate");

        let better = match best {
            None => true,
            Some((_, best_score, best_priority)) => {
                score > best_score || (score == best_score && attr.priority > best_priority)
            }
        };
        if better {
            best = Some((rsc_index, score, attr.priority));
        }
    }

    let Some((best_index, _, _)) = best else {
        debug!("no support for device atomics");
        return 0;
    };

    let best_rsc = &input.rscs[best_index];
    let mut atomic_tls = 0u64;
    for (rsc_index, rsc) in input.rscs.iter().enumerate() {
        if (supp_tls & (1u64 << rsc_index)) != 0
            && rsc.md_index == best_rsc.md_index
            && rsc.dev_name == best_rsc.dev_name
        {
            enable_atomic_tl(&mut atomic_tls, "device", rsc_index, input);
        }
    }
    atomic_tls
}

/// Device mode if any interface advertises device atomics, else CPU mode.
fn init_guess_atomics(input: &AtomicSelectInput<'_>) -> u64 {
    let accumulated = input
        .attrs
        .iter()
        .fold(IfaceFlags::empty(), |acc, attr| acc | attr.flags);

    if accumulated.contains(IfaceFlags::ATOMIC_DEVICE) {
        init_device_atomics(input)
    } else {
        init_cpu_atomics(input)
    }
}

fn enable_atomic_tl(atomic_tls: &mut u64, mode: &str, rsc_index: usize, input: &AtomicSelectInput<'_>) {
    trace!(
        mode,
        rsc_index,
        rsc = %input.rscs[rsc_index],
        "using atomics on interface"
    );
    *atomic_tls |= 1u64 << rsc_index;
}

/// Reciprocal of the estimated time of one 8-byte atomic between the
/// candidate and the virtual ideal peer.
fn amo_score(attr: &IfaceAttr, ideal: &IfaceAttr) -> f64 {
    let bandwidth = attr.bandwidth.min(ideal.bandwidth);
    let transfer = if bandwidth > 0.0 {
        AMO_SIZE / bandwidth
    } else {
        return 0.0;
    };
    let time = attr.overhead + ideal.overhead + attr.latency.max(ideal.latency) + transfer;
    if time > 0.0 {
        1.0 / time
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsc(tl: &str, dev: &str, md_index: usize) -> TlResource {
        TlResource {
            tl_name: tl.to_string(),
            dev_name: dev.to_string(),
            md_index,
        }
    }

    fn attr(flags: IfaceFlags, priority: u8, bandwidth: f64, overhead: f64) -> IfaceAttr {
        IfaceAttr {
            flags,
            priority,
            bandwidth,
            overhead,
            ..Default::default()
        }
    }

    fn device_flags() -> IfaceFlags {
        IfaceFlags::atomic_set_for(Features::AMO64) | IfaceFlags::ATOMIC_DEVICE
    }

    #[test]
    fn test_device_mode_enables_device_siblings() {
        // Two interfaces on the same device, one with higher priority; both
        // share the winner's (md, device) pair, so both bits are set.
        let rscs = [rsc("fab", "dev0", 0), rsc("fab2", "dev0", 0)];
        let mds = [MdAttr {
            supports_reg: true,
            rkey_packed_size: 16,
        }];
        let attrs = [
            attr(device_flags(), 1, 10e9, 1e-6),
            attr(device_flags(), 2, 10e9, 1e-6),
        ];
        let input = AtomicSelectInput {
            features: Features::AMO64,
            mode: AtomicMode::Device,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0b11);
    }

    #[test]
    fn test_device_mode_excludes_other_devices() {
        let rscs = [rsc("fab", "dev0", 0), rsc("fab", "dev1", 0)];
        let mds = [MdAttr {
            supports_reg: true,
            rkey_packed_size: 16,
        }];
        // dev1 scores higher (less overhead), so only its bit is set.
        let attrs = [
            attr(device_flags(), 0, 10e9, 5e-6),
            attr(device_flags(), 0, 10e9, 1e-6),
        ];
        let input = AtomicSelectInput {
            features: Features::AMO64,
            mode: AtomicMode::Device,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0b10);
    }

    #[test]
    fn test_guess_falls_back_to_cpu() {
        // No device atomics anywhere: guess enables every CPU-atomics
        // interface.
        let rscs = [rsc("shm", "mem0", 0), rsc("loop", "self", 0)];
        let mds = [MdAttr::default()];
        let attrs = [
            attr(IfaceFlags::ATOMIC_CPU, 0, 1e9, 0.0),
            attr(IfaceFlags::ATOMIC_CPU, 0, 1e9, 0.0),
        ];
        let input = AtomicSelectInput {
            features: Features::AMO32,
            mode: AtomicMode::Guess,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0b11);
    }

    #[test]
    fn test_no_candidate_disables_atomics() {
        let rscs = [rsc("fab", "dev0", 0)];
        // Registration unsupported: the only candidate is filtered out.
        let mds = [MdAttr {
            supports_reg: false,
            rkey_packed_size: 0,
        }];
        let attrs = [attr(device_flags(), 0, 10e9, 1e-6)];
        let input = AtomicSelectInput {
            features: Features::AMO64,
            mode: AtomicMode::Device,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0);
    }

    #[test]
    fn test_features_off_means_disabled() {
        let rscs = [rsc("fab", "dev0", 0)];
        let mds = [MdAttr::default()];
        let attrs = [attr(device_flags() | IfaceFlags::ATOMIC_CPU, 0, 1e9, 0.0)];
        let input = AtomicSelectInput {
            features: Features::AM,
            mode: AtomicMode::Guess,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0);
    }

    #[test]
    fn test_priority_breaks_score_ties() {
        let rscs = [rsc("fab", "dev0", 0), rsc("fab", "dev1", 0)];
        let mds = [MdAttr {
            supports_reg: true,
            rkey_packed_size: 16,
        }];
        let attrs = [
            attr(device_flags(), 1, 10e9, 1e-6),
            attr(device_flags(), 3, 10e9, 1e-6),
        ];
        let input = AtomicSelectInput {
            features: Features::AMO64,
            mode: AtomicMode::Device,
            rscs: &rscs,
            mds: &mds,
            attrs: &attrs,
        };
        assert_eq!(select_atomic_tls(&input), 0b10);
    }
}
