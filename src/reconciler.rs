// This module implements frame reconciliation: at a control-flow join every live value
// must move from the register or stack slot it currently occupies to the one the join
// expects. remap_frame_layout takes the two parallel location lists and an optional
// scratch register and drives a MoveEmitter. Pairs whose source already equals the
// destination are dropped. The remaining destinations are serviced in repeated passes
// over the input order, each one only once nothing still pending reads it. When a pass
// makes no progress, only disjoint cycles are left; each is broken by saving one
// element, either in the scratch register or on the machine stack, walking the cycle,
// and restoring the saved value into the last slot. Stack-to-stack transfers go through
// the scratch register or through a push/pop pair. Constants are only ever sources.
// The output depends only on the input order, so identical inputs give identical code.
// A register the emitter reserves for its own encodings must not hold a live value,
// just like the scratch register.

//! Register/stack reconciliation at control-flow joins.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::core::error::{EncodingError, ReconciliationError};
use crate::core::location::{Location, Reg};

/// Sink for the moves the reconciler decides on.
///
/// `emit_move` must handle every register/stack/constant combination except
/// stack to stack, which the reconciler never requests.
pub trait MoveEmitter {
    fn emit_move(&mut self, src: Location, dst: Location) -> Result<(), EncodingError>;
    fn emit_push(&mut self, src: Location) -> Result<(), EncodingError>;
    fn emit_pop(&mut self, dst: Location) -> Result<(), EncodingError>;

    /// Register the emitter itself may overwrite while encoding a move,
    /// e.g. to materialise a wide constant. It must not hold a live value.
    fn reserved_scratch(&self) -> Option<Reg> {
        None
    }
}

/// Identity of a storage location, ignoring width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Reg(Reg),
    Stack(i32),
}

fn key(loc: &Location) -> Option<Key> {
    match loc {
        Location::Register(r) => Some(Key::Reg(*r)),
        Location::StackSlot(s) => Some(Key::Stack(s.offset)),
        _ => None,
    }
}

fn is_single_word_stack(loc: &Location) -> bool {
    matches!(loc, Location::StackSlot(s) if s.width_words == 1)
}

/// Whether `loc` can pass through a general-purpose scratch register.
fn fits_gpr(loc: &Location) -> bool {
    match loc {
        Location::Register(r) => r.is_gpr(),
        Location::StackSlot(s) => s.width_words == 1,
        _ => false,
    }
}

/// Check the input and turn it into the list of real moves, in input order.
fn collect_moves(
    src_locations: &[Location],
    dst_locations: &[Location],
    scratch: Option<Reg>,
    reserved: Option<Reg>,
) -> Result<Vec<(Location, Location)>, ReconciliationError> {
    if src_locations.len() != dst_locations.len() {
        return Err(ReconciliationError::LengthMismatch {
            sources: src_locations.len(),
            destinations: dst_locations.len(),
        });
    }

    let mut assigned: HashMap<Key, Location> = HashMap::new();
    let mut moves = Vec::with_capacity(src_locations.len());

    for (src, dst) in src_locations.iter().zip(dst_locations) {
        let dst_key = key(dst).ok_or(ReconciliationError::InvalidDestination(*dst))?;
        let src_key = match src {
            Location::Immediate(_) => None,
            _ => Some(key(src).ok_or(ReconciliationError::InvalidSource(*src))?),
        };
        for reg in scratch.into_iter().chain(reserved) {
            let reg_key = Some(Key::Reg(reg));
            if reg_key == Some(dst_key) || reg_key == src_key {
                return Err(ReconciliationError::ScratchInUse(reg));
            }
        }

        if let Some(first) = assigned.get(&dst_key) {
            if first != src {
                return Err(ReconciliationError::ConflictingSources {
                    dest: *dst,
                    first: *first,
                    second: *src,
                });
            }
            continue;
        }
        assigned.insert(dst_key, *src);

        if src_key != Some(dst_key) {
            moves.push((*src, *dst));
        }
    }
    Ok(moves)
}

/// Emit moves so that each `dst_locations[i]` ends up holding the value
/// currently in `src_locations[i]`.
pub fn remap_frame_layout<E: MoveEmitter + ?Sized>(
    emitter: &mut E,
    src_locations: &[Location],
    dst_locations: &[Location],
    scratch: Option<Reg>,
) -> Result<(), ReconciliationError> {
    let moves = collect_moves(src_locations, dst_locations, scratch, emitter.reserved_scratch())?;
    if moves.is_empty() {
        return Ok(());
    }
    debug!("reconciling {} moves, scratch {:?}", moves.len(), scratch);

    // Number of pending moves that still read each destination.
    let mut readers: HashMap<Key, usize> = HashMap::new();
    let mut by_dst: HashMap<Key, usize> = HashMap::new();
    for (i, (_, dst)) in moves.iter().enumerate() {
        if let Some(k) = key(dst) {
            readers.insert(k, 0);
            by_dst.insert(k, i);
        }
    }
    for (src, _) in &moves {
        if let Some(count) = key(src).and_then(|k| readers.get_mut(&k)) {
            *count += 1;
        }
    }

    let mut pending = vec![true; moves.len()];
    loop {
        let mut progress = false;
        for (i, (src, dst)) in moves.iter().enumerate() {
            if !pending[i] {
                continue;
            }
            let dst_key = key(dst);
            if dst_key.and_then(|k| readers.get(&k)).copied().unwrap_or(0) != 0 {
                continue;
            }
            pending[i] = false;
            if let Some(count) = key(src).and_then(|k| readers.get_mut(&k)) {
                *count -= 1;
            }
            transfer(emitter, *src, *dst, scratch)?;
            progress = true;
        }
        if !progress {
            break;
        }
    }

    // Whatever is left forms disjoint cycles.
    for start in 0..moves.len() {
        if !pending[start] {
            continue;
        }
        let mut members = vec![moves[start].1];
        let mut current = start;
        loop {
            pending[current] = false;
            let src = moves[current].0;
            let next = key(&src)
                .and_then(|k| by_dst.get(&k))
                .copied()
                .filter(|&j| pending[j] || j == start);
            match next {
                Some(j) if j != start => {
                    members.push(moves[j].1);
                    current = j;
                }
                _ => break,
            }
        }
        break_cycle(emitter, &members, scratch)?;
    }
    Ok(())
}

/// Resolve the cycle `members[0] <- members[1] <- ... <- members[k] <- members[0]`.
fn break_cycle<E: MoveEmitter + ?Sized>(
    emitter: &mut E,
    members: &[Location],
    scratch: Option<Reg>,
) -> Result<(), ReconciliationError> {
    let (first, last) = match (members.first(), members.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Ok(()),
    };
    let stack_to_stack = members
        .windows(2)
        .any(|pair| pair[0].is_stack() && pair[1].is_stack());
    let saver = scratch.filter(|s| s.is_gpr() && members.iter().all(fits_gpr) && !stack_to_stack);

    trace!(
        "cycle of {} through {}",
        members.len(),
        saver.map_or_else(|| "the stack".to_string(), |s| s.to_string())
    );

    match saver {
        Some(reg) => emitter.emit_move(first, reg.into())?,
        None => emitter.emit_push(first)?,
    }
    for pair in members.windows(2) {
        transfer(emitter, pair[1], pair[0], scratch)?;
    }
    match saver {
        Some(reg) => emitter.emit_move(reg.into(), last)?,
        None => emitter.emit_pop(last)?,
    }
    Ok(())
}

/// One move, routing stack-to-stack through the scratch register or the
/// machine stack.
fn transfer<E: MoveEmitter + ?Sized>(
    emitter: &mut E,
    src: Location,
    dst: Location,
    scratch: Option<Reg>,
) -> Result<(), EncodingError> {
    if src.is_stack() && dst.is_stack() {
        let via = scratch.filter(|s| s.is_gpr() && is_single_word_stack(&src) && is_single_word_stack(&dst));
        match via {
            Some(reg) => {
                emitter.emit_move(src, reg.into())?;
                emitter.emit_move(reg.into(), dst)
            }
            None => {
                emitter.emit_push(src)?;
                emitter.emit_pop(dst)
            }
        }
    } else {
        emitter.emit_move(src, dst)
    }
}
