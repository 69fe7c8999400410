//! Root Enumeration
//!
//! Builds the per-cycle list of memory regions that are live by
//! definition. Runs only while the world is stopped. Regions are emitted
//! in a fixed order:
//!
//! 1. registered global data, in [`DATA_BLOCK`] pieces
//! 2. the word holding each span's out-of-line type table
//! 3. the live part of every paused context's stack segments
//! 4. the contents of every object with a registered finalizer
//! 5. the used records of every finalizer block
//!
//! The [`RootSet`] is cleared and refilled each cycle; its capacity is
//! kept.

use crate::heap::{Heap, TypeCompression};
use crate::runtime::finalizer::Finalizers;
use crate::runtime::world::{ContextRole, ContextStatus, ExecutionContext, StackRange, STACK_GUARD};
use crate::util::WORD;
use std::sync::Arc;

/// Global data is scanned in pieces of this size
pub const DATA_BLOCK: usize = 8 * 1024;

/// A region to scan conservatively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub ptr: usize,
    pub len: usize,
}

/// Roots of one cycle
#[derive(Debug, Default)]
pub struct RootSet {
    roots: Vec<Root>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.roots.clear();
    }

    #[inline]
    pub fn add(&mut self, ptr: usize, len: usize) {
        if len > 0 {
            self.roots.push(Root { ptr, len });
        }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn as_slice(&self) -> &[Root] {
        &self.roots
    }

    pub fn capacity(&self) -> usize {
        self.roots.capacity()
    }
}

/// Everything the enumerator reads
pub struct RootSources<'a> {
    pub heap: &'a Heap,
    pub globals: &'a [Root],
    pub contexts: &'a [Arc<ExecutionContext>],
    /// Context running the collection; it is not paused
    pub caller: Option<&'a ExecutionContext>,
    pub finalizers: &'a Finalizers,
    pub debug_mark: bool,
}

impl RootSources<'_> {
    /// Rebuild `set` from scratch
    pub fn enumerate(&self, set: &mut RootSet) {
        set.clear();
        self.add_globals(set);
        self.add_span_types(set);
        for ctx in self.contexts {
            self.add_context(set, ctx);
        }
        self.add_finalizer_objects(set);
        for (ptr, len) in self.finalizers.queue.block_roots() {
            set.add(ptr, len);
        }
        log::trace!("{} roots", set.len());
    }

    fn add_globals(&self, set: &mut RootSet) {
        for g in self.globals {
            let end = g.ptr + g.len;
            let mut p = g.ptr;
            while p < end {
                set.add(p, DATA_BLOCK.min(end - p));
                p += DATA_BLOCK;
            }
        }
    }

    fn add_span_types(&self, set: &mut RootSet) {
        for span in self.heap.spans().snapshot() {
            if !span.in_use() {
                continue;
            }
            match span.types.compression() {
                TypeCompression::Words | TypeCompression::Bytes => {
                    set.add(span.types.data_addr(), WORD)
                }
                TypeCompression::Empty | TypeCompression::Single => {}
            }
        }
    }

    fn add_context(&self, set: &mut RootSet, ctx: &ExecutionContext) {
        if ctx.role() == ContextRole::GcHelper {
            return;
        }
        let is_caller = self.caller.is_some_and(|c| std::ptr::eq(c, ctx));
        match ctx.status() {
            ContextStatus::Dead => return,
            ContextStatus::Running | ContextStatus::PauseRequested if !is_caller => {
                crate::fatal!(
                    "root enumeration: context {} is {:?}; world not stopped",
                    ctx.id(),
                    ctx.status()
                );
            }
            _ => {}
        }
        add_stack_roots(set, ctx.id(), &ctx.stack_ranges());
    }

    fn add_finalizer_objects(&self, set: &mut RootSet) {
        let bitmap = self.heap.bitmap();
        for obj in self.finalizers.table.objects() {
            let (base, size) = match self.heap.lookup_object(obj) {
                Some(found) => found,
                None => crate::fatal!("mark: finalizer inconsistency at {:#x}", obj),
            };
            if !self.debug_mark && !bitmap.is_special(base) {
                crate::fatal!("mark: finalizer inconsistency at {:#x}", obj);
            }
            // The object itself stays collectable; only what it references
            // is kept alive.
            set.add(base, size);
        }
    }
}

/// One root per live segment, newest first
///
/// A stack pointer outside `[guard - STACK_GUARD, base]` means the stack
/// is corrupt and is fatal.
pub fn add_stack_roots(set: &mut RootSet, ctx_id: u64, ranges: &[StackRange]) {
    for (n, r) in ranges.iter().enumerate() {
        if r.sp < r.guard.saturating_sub(STACK_GUARD) || r.base < r.sp {
            crate::fatal!(
                "scanstack inconsistent: context {} segment {} sp={:#x} not in [{:#x}, {:#x}]",
                ctx_id,
                n,
                r.sp,
                r.guard.saturating_sub(STACK_GUARD),
                r.base
            );
        }
        set.add(r.sp, r.base - r.sp);
    }
}
