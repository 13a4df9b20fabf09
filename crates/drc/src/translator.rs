//! The translator: code buffer, block cache and the entry points the
//! dispatcher, the memory subsystem and generated code call.

use std::ops::Range;

use drc_cfg::{DecodedBlock, Liveness, ScanConfig, page_of, scan_block};
use drc_emit::{CodeBuffer, EmitError, EmitInput, EmittedBlock, emit_block};
use drc_regalloc::{Allocation, allocate};
use drc_state::{CpuContext, ExecMemory, GuestMemory, HostHooks, InvalidCode};
use tracing::{debug, info, info_span, trace_span, warn};

use crate::cache::{Block, BlockCache, BlockId, BlockState, CacheStats, Lookup, PageState};
use crate::config::TranslatorConfig;
use crate::dispatch::{DISPATCH_SIZE, Dispatcher, EnterFn};
use crate::error::{Error, Result};
use crate::hooks;
use crate::metrics;
use crate::source::GuestCode;
use crate::summary::BlockSummary;

/// Alignment of block starts in the code buffer.
const BLOCK_ALIGN: usize = 16;

/// Owns translated code and everything needed to find, check and discard it.
///
/// One translator serves any number of [`CpuContext`]s; generated code
/// reaches it through the back-pointer [`attach`](Self::attach) stores in
/// each context, so the translator must not move while generated code runs.
pub struct TranslatorContext {
    config: TranslatorConfig,
    memory: GuestMemory,
    invalid: InvalidCode,
    exec: ExecMemory,
    dispatcher: Dispatcher,
    pub(crate) cache: BlockCache,
    /// Next free code offset.
    pos: usize,
    wraps: u64,
}

impl TranslatorContext {
    /// Map the code buffer and write the dispatcher trampolines.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or the buffer
    /// cannot be mapped.
    pub fn new(config: TranslatorConfig, memory: GuestMemory) -> Result<Self> {
        config.cache.validate(DISPATCH_SIZE)?;
        let mut exec = ExecMemory::new(config.cache.buffer_size)?;
        let base = exec.base();
        let dispatcher = Dispatcher::emit(exec.as_mut_slice(), base)?;
        let cache = BlockCache::new(&config.cache, DISPATCH_SIZE, exec.size());
        info!(
            isa = %config.isa,
            buffer = format_args!("{:#x}", exec.size()),
            window = format_args!("{:#x}", config.cache.block_window),
            "translator ready"
        );
        Ok(Self {
            config,
            memory,
            invalid: InvalidCode::new(),
            exec,
            dispatcher,
            cache,
            pos: DISPATCH_SIZE,
            wraps: 0,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Guest memory without write notification. Use [`write`](Self::write)
    /// or [`load`](Self::load), or notify afterwards, when the bytes may
    /// hold code.
    pub const fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    #[must_use]
    pub const fn invalid_code(&self) -> &InvalidCode {
        &self.invalid
    }

    /// The whole code buffer, dispatcher included.
    #[must_use]
    pub const fn code(&self) -> &[u8] {
        self.exec.as_slice()
    }

    /// Host address of code offset `offset`.
    #[must_use]
    pub fn host_ptr(&self, offset: usize) -> *const u8 {
        self.exec.as_ptr().wrapping_add(offset).cast_const()
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.cache.get(id)
    }

    /// Live block with an entry at `addr`, without touching any statistic.
    #[must_use]
    pub fn block_at(&self, addr: u32) -> Option<BlockId> {
        self.cache
            .find_clean(addr)
            .map(|(id, _)| id)
            .or_else(|| self.cache.find_dirty(addr))
    }

    /// Every block in the cache, including invalidated ones awaiting expiry.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.cache.blocks()
    }

    #[must_use]
    pub fn page_state(&self, page: u32) -> PageState {
        self.cache.page_state(page)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            wraps: self.wraps,
            live_blocks: self.cache.blocks().filter(|(_, b)| b.is_live()).count(),
            code_bytes: self.cache.code_bytes(),
            ..self.cache.stats
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Block to run for `addr`, compiling it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not executable or the block cannot be
    /// emitted.
    pub fn translate(&mut self, addr: u32) -> Result<BlockId> {
        self.tracked(|t| t.resolve(addr, None, false))
            .map(|found| found.map(|(id, _)| id))?
            .ok_or(Error::MissingEntry(addr))
    }

    /// Host code pointer for `addr`, compiling it if necessary.
    ///
    /// # Errors
    ///
    /// See [`translate`](Self::translate).
    pub fn lookup(&mut self, addr: u32) -> Result<*const u8> {
        self.lookup_offset(addr).map(|offset| self.host_ptr(offset))
    }

    /// Code offset to jump to for `addr`, compiling it if necessary.
    ///
    /// # Errors
    ///
    /// See [`translate`](Self::translate).
    pub fn lookup_offset(&mut self, addr: u32) -> Result<usize> {
        self.tracked(|t| t.resolve(addr, None, false))?
            .map(|(_, offset)| offset)
            .ok_or(Error::MissingEntry(addr))
    }

    /// Find or build the translation for `addr`.
    ///
    /// A compile that would overwrite `protect` is not attempted and yields
    /// `None`. With `verify_entry`, a restore candidate starting at `addr`
    /// is answered with its verify entry instead of being checked here.
    pub(crate) fn resolve(
        &mut self,
        addr: u32,
        protect: Option<Range<usize>>,
        verify_entry: bool,
    ) -> Result<Option<(BlockId, usize)>> {
        match self.cache.lookup(addr) {
            Lookup::Hit { block, offset } => return Ok(Some((block, offset))),
            Lookup::Dirty(id) => {
                let block = self.cache.get(id);
                if verify_entry
                    && let Some(b) = block
                    && b.start == addr
                    && let Some(offset) = b.verify_entry
                {
                    return Ok(Some((id, offset)));
                }
                if self.check_dirty(id)
                    && let Some(offset) = self.cache.get(id).and_then(|b| b.entry(addr))
                {
                    return Ok(Some((id, offset)));
                }
            }
            Lookup::Miss => {}
        }
        let Some(id) = self.compile(addr, protect)? else {
            return Ok(None);
        };
        let offset = self
            .cache
            .get(id)
            .and_then(|b| b.entry(addr))
            .ok_or(Error::MissingEntry(addr))?;
        Ok(Some((id, offset)))
    }

    /// Reinstate restore candidate `id` if its source is unchanged, otherwise
    /// invalidate it. Returns whether it was restored.
    fn check_dirty(&mut self, id: BlockId) -> bool {
        let Some(block) = self.cache.get(id) else { return false };
        if block.state != BlockState::Dirty {
            return block.state == BlockState::Clean;
        }
        let code = self.exec.as_mut_slice();
        if block.source_matches(&self.memory) {
            self.cache.restore(id, code, &mut self.invalid);
            true
        } else {
            self.cache.invalidate(id, code, &mut self.invalid);
            false
        }
    }

    /// Check the block starting at `start` against guest memory. Called by
    /// the verify entry of a restore candidate.
    pub fn verify_block(&mut self, start: u32) -> bool {
        self.tracked(|t| {
            let dirty = t.cache.find_dirty(start).filter(|&id| t.cache.get(id).is_some_and(|b| b.start == start));
            match dirty {
                Some(id) => t.check_dirty(id),
                None => t.cache.has_clean(start),
            }
        })
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    /// Compile the block at `addr` into the next window of the code buffer.
    fn compile(&mut self, addr: u32, protect: Option<Range<usize>>) -> Result<Option<BlockId>> {
        let _span = info_span!("compile", addr = format_args!("{addr:#010x}")).entered();
        let size = self.exec.size();
        let mut scan = ScanConfig::default().with_max_instrs(self.config.cache.max_block);
        loop {
            let block = {
                let _span = trace_span!("decode").entered();
                let src = GuestCode { memory: &self.memory, cache: &self.cache };
                scan_block(self.config.isa, &src, addr, &scan)?
            };
            let live = {
                let _span = trace_span!("liveness").entered();
                Liveness::analyze(&block, self.config.alloc.liveness_depth)
            };
            let alloc = {
                let _span = trace_span!("allocate").entered();
                allocate(&block, &live, &self.config.alloc)
            };

            let window = self.pos..(self.pos + self.config.cache.block_window).min(size);
            if protect.as_ref().is_some_and(|p| p.start < window.end && window.start < p.end) {
                debug!(addr = format_args!("{addr:#010x}"), "compile deferred to the dispatcher");
                return Ok(None);
            }
            self.cache.ensure_expired(&window, self.exec.as_mut_slice(), &mut self.invalid);

            let base = self.exec.base();
            let input = EmitInput {
                block: &block,
                live: &live,
                alloc: &alloc,
                map: self.memory.map(),
            };
            let buf = CodeBuffer::new(self.exec.as_mut_slice(), base, window.start, window.end);
            let emitted = {
                let _span = trace_span!("emit").entered();
                emit_block(buf, &input, &self.config.emit)
            };
            match emitted {
                Ok(emitted) => return Ok(Some(self.install(&block, &alloc, emitted))),
                Err(EmitError::Overflow { .. }) if window.end == size && window.start > DISPATCH_SIZE => {
                    self.pos = DISPATCH_SIZE;
                    self.wraps += 1;
                    self.cache.expiry.wrapped();
                    debug!(wraps = self.wraps, "code buffer wrapped");
                }
                Err(EmitError::Overflow { needed, limit }) if block.len() > 1 => {
                    let shorter = block.len() / 2;
                    warn!(
                        addr = format_args!("{addr:#010x}"),
                        instrs = block.len(),
                        needed,
                        limit,
                        "block truncated to fit its window"
                    );
                    scan = scan.with_max_instrs(shorter);
                }
                Err(EmitError::Overflow { .. }) => return Err(Error::BlockTooLarge(addr)),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Register an emitted block with the cache and advance the cursor.
    fn install(&mut self, decoded: &DecodedBlock, alloc: &Allocation, emitted: EmittedBlock) -> BlockId {
        let _span = trace_span!("link").entered();
        let summary = BlockSummary::new(decoded, alloc, &emitted);
        let source = source_range(decoded);
        let shadow = self
            .memory
            .bytes(source.start, (source.end - source.start) as usize)
            .map(Box::from);
        let code = emitted.start..emitted.end;
        let host_bytes = code.len();
        let block = Block {
            start: decoded.start,
            pages: page_of(source.start)..=page_of(source.end - 1),
            source,
            code: code.clone(),
            entries: emitted.entries,
            verify_entry: emitted.verify_entry,
            links: emitted.links,
            state: BlockState::Clean,
            heat: 0,
            summary,
            shadow,
            incoming: Vec::new(),
        };
        let id = self.cache.insert(block, &mut self.invalid);
        self.pos = code.end.next_multiple_of(BLOCK_ALIGN).min(self.exec.size());

        let exec = self.exec.as_mut_slice();
        for site in self.cache.link_sites(id) {
            self.cache.resolve_link(site, exec);
        }
        let next = self.cache.expiry.next_region(self.cache.expiry.region_of(code.end - 1));
        let ahead = self.cache.expiry.region_range(next);
        if !(ahead.start < code.end && code.start < ahead.end) {
            self.cache.begin_expiry(next, exec, &mut self.invalid);
        }
        self.cache.expire_steps(self.config.cache.expiry_steps, exec, &mut self.invalid);

        let isa = self.config.isa.name();
        metrics::record_block(isa, host_bytes);
        metrics::record_occupancy(isa, self.cache.code_bytes(), self.exec.size() - DISPATCH_SIZE);
        debug!(
            block = %id,
            start = format_args!("{:#010x}", decoded.start),
            instrs = decoded.len(),
            bytes = host_bytes,
            "compiled"
        );
        id
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Resolve the external jump at `site` to `target`, compiling the target
    /// if needed, and patch the site when the target is clean.
    pub(crate) fn link(&mut self, target: u32, site: usize) -> Result<Option<usize>> {
        self.tracked(|t| -> Result<Option<usize>> {
            if let Some(offset) = t.cache.resolve_link(site, t.exec.as_mut_slice()) {
                return Ok(Some(offset));
            }
            let protect = t.running_code(site);
            let Some((_, offset)) = t.resolve(target, Some(protect), true)? else {
                return Ok(None);
            };
            if t.cache.site_target(site) == Some(target) {
                t.cache.resolve_link(site, t.exec.as_mut_slice());
            }
            Ok(Some(offset))
        })
    }

    /// Code offset for `addr` requested by generated code at `site`.
    pub(crate) fn lookup_from_code(&mut self, addr: u32, site: usize) -> Result<Option<usize>> {
        self.tracked(|t| -> Result<Option<usize>> {
            let protect = t.running_code(site);
            Ok(t.resolve(addr, Some(protect), true)?.map(|(_, offset)| offset))
        })
    }

    /// Code that may still be running when generated code calls out at
    /// `offset`: its block, or every byte a block there could span once
    /// the block has been reclaimed.
    pub(crate) fn running_code(&self, offset: usize) -> Range<usize> {
        self.cache
            .block_containing(offset)
            .and_then(|id| self.cache.get(id))
            .map_or_else(
                || {
                    let window = self.config.cache.block_window;
                    offset.saturating_sub(window)..offset + window
                },
                |b| b.code.clone(),
            )
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Tell the translator `len` bytes at `addr` were written. Blocks built
    /// from those bytes are invalidated, or kept as restore candidates when
    /// hot. Returns whether the block starting at `running` was among them.
    pub fn notify_write(&mut self, addr: u32, len: u32, running: Option<u32>) -> bool {
        let threshold = self.config.cache.restore_threshold;
        self.tracked(|t| {
            t.cache
                .notify_write(addr, len, running, threshold, t.exec.as_mut_slice(), &mut t.invalid)
        })
    }

    /// A write the memory subsystem cannot attribute to exact bytes: every
    /// clean block on the touched pages becomes a restore candidate.
    pub fn notify_bulk_write(&mut self, addr: u32, len: u32) -> usize {
        let changed = self.cache.notify_bulk_write(addr, len, self.exec.as_mut_slice(), &mut self.invalid);
        debug!(addr = format_args!("{addr:#010x}"), len, changed, "bulk write");
        changed
    }

    /// Store `size` bytes of `value` at `addr` and notify.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not mapped.
    pub fn write(&mut self, addr: u32, size: u32, value: u64) -> Result<bool> {
        self.memory.write(addr, size, value)?;
        Ok(self.notify_write(addr, size, None))
    }

    /// Copy `data` to `addr` and notify.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not mapped.
    pub fn load(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.memory.load(addr, data)?;
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        self.notify_write(addr, len, None);
        Ok(())
    }

    // ========================================================================
    // Contexts
    // ========================================================================

    /// A context wired to this translator, with `hooks` for everything the
    /// translator does not handle itself.
    pub fn new_context(&mut self, hooks: HostHooks) -> CpuContext {
        let mut ctx = CpuContext::new(hooks);
        self.attach(&mut ctx);
        ctx
    }

    /// Point `ctx` at this translator's tables, exit trampoline and hooks.
    pub fn attach(&mut self, ctx: &mut CpuContext) {
        ctx.attach_tables(self.memory.map(), &self.invalid);
        ctx.exit = self.host_ptr(self.dispatcher.exit);
        ctx.translator = std::ptr::from_mut(self).cast();
        ctx.hooks.lookup = hooks::lookup_hook;
        ctx.hooks.link = hooks::link_hook;
        ctx.hooks.verify = hooks::verify_hook;
        ctx.hooks.notify = hooks::notify_hook;
    }

    /// Run generated code from `ctx.pc` until it exits to the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the first block cannot be translated.
    ///
    /// # Safety
    ///
    /// Generated code runs with the hooks in `ctx`; the embedder's hooks
    /// must uphold the host calling convention, and no other reference to
    /// this translator may be used until the call returns.
    pub unsafe fn execute(&mut self, ctx: &mut CpuContext) -> Result<()> {
        self.attach(ctx);
        let entry = self.lookup(ctx.pc)?;
        // SAFETY: the dispatcher was emitted at `enter` with this signature.
        let enter: EnterFn = unsafe { std::mem::transmute(self.host_ptr(self.dispatcher.enter)) };
        unsafe { enter(std::ptr::from_mut(ctx), entry) };
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every translation. Counters are kept.
    pub fn reset(&mut self) {
        self.cache.clear(&mut self.invalid);
        self.pos = DISPATCH_SIZE;
        info!("translator reset");
    }

    /// Release the code buffer and report final counters.
    #[must_use]
    pub fn teardown(self) -> CacheStats {
        let stats = self.stats();
        info!(
            compiled = stats.compiled,
            invalidations = stats.invalidations,
            expired = stats.expired,
            "translator torn down"
        );
        stats
    }

    /// Run `f` and report the counters it changed.
    fn tracked<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let before = self.cache.stats;
        let out = f(self);
        metrics::record_stats(self.config.isa.name(), &before, &self.cache.stats);
        out
    }
}

/// Guest bytes a block was built from: its instructions plus folded literals.
fn source_range(block: &DecodedBlock) -> Range<u32> {
    block.data_ranges.iter().fold(block.start..block.end, |r, d| {
        r.start.min(d.addr)..r.end.max(d.addr + d.len)
    })
}
