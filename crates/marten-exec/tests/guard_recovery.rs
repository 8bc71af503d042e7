//! Guard failure, fail-value recovery and bridge attachment.

use std::sync::Arc;

use marten_exec::{
    CompiledUnit, ExecContext, ExitStatus, JitRuntime, Stop, UnitDescrs, force,
};
use marten_frame::{FailLocation, FrameHandle, FrameInfo, Slot, Storage, ValueKind};

fn int_slot(slot: u32) -> FailLocation {
    FailLocation {
        kind: ValueKind::Int,
        storage: Storage::Slot(slot),
    }
}

/// Computes `a + b` but only while `a` is positive; otherwise the guard
/// fails with `a` and `b` live.
fn checked_sum(frame: FrameHandle, ctx: &mut ExecContext<'_>) -> FrameHandle {
    let descrs = ctx.unit_descrs();
    let core = ctx.core();
    let a = core.arena.get_int(frame, 0);
    let b = core.arena.get_int(frame, 1);
    if a <= 0 {
        return ctx.guard_failed(frame, descrs.guards[0]);
    }
    core.arena.set_int(frame, 2, a + b);
    ctx.finish(frame, descrs.finish)
}

/// Bridge compiled for the failing guard: handles the non-positive case
/// as `b - a` instead of bailing out.
fn negate_bridge(frame: FrameHandle, ctx: &mut ExecContext<'_>) -> FrameHandle {
    let descrs = ctx.unit_descrs();
    let core = ctx.core();
    let a = core.arena.get_int(frame, 0);
    let b = core.arena.get_int(frame, 1);
    core.arena.set_int(frame, 2, b - a);
    ctx.finish(frame, descrs.finish)
}

fn checked_sum_unit(ctx: &mut ExecContext<'_>) -> CompiledUnit {
    let core = ctx.core();
    let finish = core
        .descrs
        .register_finish(&[(2, ValueKind::Int)], &core.gcmaps, 4);
    let guard = core.descrs.register_guard(
        11,
        7,
        &[int_slot(0), int_slot(1)],
        &core.gcmaps,
        4,
    );
    CompiledUnit::new(
        4,
        checked_sum,
        vec![(0, ValueKind::Int), (1, ValueKind::Int)],
        UnitDescrs::with_guards(finish, &[guard]),
    )
}

#[test]
fn guard_failure_recovers_fail_values() {
    let rt = JitRuntime::new();
    let mut ctx = rt.attach();
    let unit = checked_sum_unit(&mut ctx);

    // Happy path first: the guard holds.
    let handle = ctx.enter(&unit, &[Slot::Int(4), Slot::Int(9)]).unwrap();
    match ctx.exit(handle) {
        ExitStatus::Finished { values, .. } => assert_eq!(values.as_slice(), &[Slot::Int(13)]),
        other => panic!("expected a clean finish, got {other:?}"),
    }

    // Now fail it and read the interpreter's resume state back out.
    let handle = ctx.enter(&unit, &[Slot::Int(-3), Slot::Int(5)]).unwrap();
    let token = match ctx.exit(handle) {
        ExitStatus::GuardFailed {
            token,
            guard_id,
            resume_pc,
            failures,
        } => {
            assert_eq!(guard_id, 11);
            assert_eq!(resume_pc, 7);
            assert_eq!(failures, 1);
            token
        }
        other => panic!("expected a guard failure, got {other:?}"),
    };

    {
        let core = ctx.core();
        let frame = core.arena.resolve(handle);
        assert_eq!(core.descrs.get_int_value(frame, 0), -3);
        assert_eq!(core.descrs.get_int_value(frame, 1), 5);
        // The guard's liveness map is installed on the bailed frame; no
        // reference slots were live here, so the collector only walks
        // the fixed fields.
        assert!(frame.gcmap().is_some());
        assert_eq!(frame.gcmap().unwrap().live_count(), 0);
        assert_eq!(frame.descr(), token.as_gc_ref());
    }

    // Interpretation resumed; the frame is done.
    ctx.core().arena.free(handle);
    assert_eq!(ctx.core().arena.live_count(), 0);
    assert_eq!(ctx.stats().guard_failures, 1);
}

#[test]
fn bridge_ends_bailouts_at_that_guard() {
    let rt = JitRuntime::new();
    let mut ctx = rt.attach();
    let mut unit = checked_sum_unit(&mut ctx);
    let guard = unit.descrs().guards[0];

    // Fail the guard twice; counts accumulate on its descriptor.
    for expected in 1..=2 {
        let handle = ctx.enter(&unit, &[Slot::Int(-3), Slot::Int(5)]).unwrap();
        match ctx.exit(handle) {
            ExitStatus::GuardFailed { failures, .. } => assert_eq!(failures, expected),
            other => panic!("expected a guard failure, got {other:?}"),
        }
        ctx.core().arena.free(handle);
    }

    // Hot enough: attach a bridge. Only dispatch is patched; the
    // descriptor and its liveness map stay valid for frames already out
    // there.
    unit.attach_bridge(guard, negate_bridge, 4);

    let handle = ctx.enter(&unit, &[Slot::Int(-3), Slot::Int(5)]).unwrap();
    match ctx.exit(handle) {
        ExitStatus::Finished { values, .. } => assert_eq!(values.as_slice(), &[Slot::Int(8)]),
        other => panic!("expected the bridge to finish, got {other:?}"),
    }

    let stats = ctx.stats();
    assert_eq!(stats.bridge_transfers, 1);
    assert_eq!(stats.guard_failures, 2);
    assert_eq!(stats.finishes, 1);
}

#[test]
fn forcing_installs_the_guard_descriptor() {
    let rt = JitRuntime::new();
    let mut ctx = rt.attach();
    let guard = {
        let core = ctx.core();
        core.descrs
            .register_guard(21, 40, &[int_slot(0)], &core.gcmaps, 2)
    };

    let core = ctx.core();
    let info = Arc::new(FrameInfo::with_depth(2));
    let handle = core.arena.allocate(&info).unwrap();
    {
        let frame = core.arena.resolve_mut(handle);
        frame.set_force_descr(guard.as_gc_ref());
        frame.set_int(0, 99);
    }
    let gcmap = core.descrs.gcmap_of(guard);
    core.arena.resolve_mut(handle).set_gcmap(Some(gcmap));

    force(core.arena.resolve_mut(handle));

    let frame = core.arena.resolve(handle);
    assert_eq!(
        core.descrs.latest(frame),
        Stop::Guard {
            token: guard,
            guard_id: 21,
            resume_pc: 40
        }
    );
    assert_eq!(core.descrs.get_int_value(frame, 0), 99);
}
