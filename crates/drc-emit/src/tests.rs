use drc_cfg::{DecodedBlock, ImageSource, Liveness, ScanConfig, scan_block};
use drc_ir::mips::LO;
use drc_isa::IsaKind;
use drc_isa::encode::{mips, sh2};
use drc_regalloc::{AllocConfig, Allocation, allocate};
use drc_state::{CpuContext, GuestMemory, MemoryMap};

use super::*;

const BASE: u32 = 0x8000_4000;
const SH2_BASE: u32 = 0x0600_4000;
const CODE_START: usize = 0x40;

struct Prepared {
    block: DecodedBlock,
    live: Liveness,
    alloc: Allocation,
}

fn prepare(isa: IsaKind, bytes: &[u8], base: u32) -> Prepared {
    let src = ImageSource::new(base, bytes);
    let block = scan_block(isa, &src, base, &ScanConfig::default()).unwrap();
    let config = AllocConfig::default();
    let live = Liveness::analyze(&block, config.liveness_depth);
    let alloc = allocate(&block, &live, &config);
    Prepared { block, live, alloc }
}

fn prepare_mips(words: &[u32]) -> Prepared {
    prepare(IsaKind::Mips, &mips::assemble(words), BASE)
}

fn emit_with(p: &Prepared, map: &MemoryMap, config: &EmitConfig, size: usize) -> (Vec<u8>, Result<EmittedBlock>) {
    let mut code = vec![0u8; size];
    let buf = CodeBuffer::new(&mut code, 0x7000_0000, CODE_START, size);
    let input = EmitInput {
        block: &p.block,
        live: &p.live,
        alloc: &p.alloc,
        map,
    };
    let result = emit_block(buf, &input, config);
    (code, result)
}

fn emit(p: &Prepared) -> (Vec<u8>, EmittedBlock) {
    let (code, result) = emit_with(p, &MemoryMap::new(), &EmitConfig::default(), 0x4000);
    (code, result.unwrap())
}

fn find(code: &[u8], pattern: &[u8]) -> Option<usize> {
    code.windows(pattern.len()).position(|w| w == pattern)
}

/// `call [r15 + offset]` with a 32-bit displacement.
fn hook_call(offset: usize) -> Vec<u8> {
    let mut bytes = vec![0x41, 0xFF, 0x97];
    bytes.extend_from_slice(&(offset as u32).to_le_bytes());
    bytes
}

#[test]
fn test_block_start_is_first_entry() {
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
    let (_, emitted) = emit(&p);
    assert_eq!(emitted.guest_start, BASE);
    assert_eq!(emitted.start, CODE_START);
    assert!(emitted.end > emitted.start);
    assert_eq!(emitted.entries[0].addr, BASE);
    assert_eq!(emitted.entry(BASE), Some(emitted.entries[0].offset));
    assert!(emitted.entries[0].offset > CODE_START);
}

#[test]
fn test_verify_entry_passes_block_start() {
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
    let (code, emitted) = emit(&p);
    assert_eq!(emitted.verify_entry, Some(CODE_START));
    // mov rdi, r15; mov esi, start
    assert_eq!(&code[CODE_START..CODE_START + 4], &[0x4C, 0x89, 0xFF, 0xBE]);
    assert_eq!(&code[CODE_START + 4..CODE_START + 8], &BASE.to_le_bytes());
    assert_eq!(find(&code, &hook_call(CpuContext::VERIFY_HOOK_OFFSET)), Some(CODE_START + 8));
}

#[test]
fn test_verify_entry_can_be_disabled() {
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
    let config = EmitConfig::default().with_verify_entry(false);
    let (code, result) = emit_with(&p, &MemoryMap::new(), &config, 0x4000);
    let emitted = result.unwrap();
    assert_eq!(emitted.verify_entry, None);
    assert_eq!(emitted.entries[0].offset, CODE_START);
    assert!(find(&code, &hook_call(CpuContext::VERIFY_HOOK_OFFSET)).is_none());
}

#[test]
fn test_jump_register_goes_through_lookup() {
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
    let (code, emitted) = emit(&p);
    assert!(emitted.links.is_empty());
    assert_eq!(emitted.stub_count(StubKind::Exit), 1);

    // the resume site handed to the lookup hook is the return address
    let call = find(&code, &hook_call(CpuContext::LOOKUP_HOOK_OFFSET)).unwrap();
    assert_eq!(code[call - 5], 0xBA);
    let mut imm = [0u8; 4];
    imm.copy_from_slice(&code[call - 4..call]);
    assert_eq!(u32::from_le_bytes(imm) as usize, call + 7);
}

#[test]
fn test_external_jump_aims_at_trampoline() {
    let target = BASE + 0x1_0000;
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::j(target), mips::nop()]);
    let (code, emitted) = emit(&p);

    let links: Vec<_> = emitted.external_links().collect();
    assert_eq!(links.len(), 1);
    let link = links[0];
    assert_eq!(link.target, target);
    assert!(link.is_external());
    let trampoline = link.trampoline.unwrap();
    assert!(trampoline > link.site && trampoline < emitted.end);
    assert_eq!(jump_target(&code, link.site), trampoline);

    // mov rdi, r15; mov esi, target; mov edx, site
    assert_eq!(&code[trampoline..trampoline + 4], &[0x4C, 0x89, 0xFF, 0xBE]);
    assert_eq!(&code[trampoline + 4..trampoline + 8], &target.to_le_bytes());
    assert_eq!(code[trampoline + 8], 0xBA);
    assert_eq!(&code[trampoline + 9..trampoline + 13], &(link.site as u32).to_le_bytes());
    assert_eq!(
        &code[trampoline + 13..trampoline + 20],
        hook_call(CpuContext::LINK_HOOK_OFFSET).as_slice()
    );
}

#[test]
fn test_patched_link_can_be_restored() {
    let target = BASE + 0x1_0000;
    let p = prepare_mips(&[mips::j(target), mips::nop()]);
    let (mut code, emitted) = emit(&p);
    let link = emitted.links[0];
    let trampoline = link.trampoline.unwrap();

    patch_jump(&mut code, link.site, 0x2000).unwrap();
    assert_eq!(jump_target(&code, link.site), 0x2000);
    patch_jump(&mut code, link.site, trampoline).unwrap();
    assert_eq!(jump_target(&code, link.site), trampoline);
}

#[test]
fn test_backward_branch_links_internally() {
    let p = prepare_mips(&[
        mips::addiu(2, 2, -1),
        mips::bne(2, 0, -2),
        mips::nop(),
        mips::jr(31),
        mips::nop(),
    ]);
    let (code, emitted) = emit(&p);
    assert_eq!(emitted.external_links().count(), 0);
    let internal: Vec<_> = emitted.links.iter().filter(|l| l.kind == LinkKind::Internal).collect();
    assert_eq!(internal.len(), 1);
    assert_eq!(internal[0].target, BASE);
    assert_eq!(internal[0].trampoline, None);

    let head = jump_target(&code, internal[0].site);
    assert!(head >= emitted.entries[0].offset);
    assert!(head < internal[0].site);
    assert_eq!(emitted.stub_count(StubKind::CycleCheck), 1);
}

#[test]
fn test_memory_access_stubs() {
    let p = prepare_mips(&[mips::lw(2, 4, 0), mips::sw(2, 4, 4), mips::jr(31), mips::nop()]);
    let (_, emitted) = emit(&p);
    assert_eq!(emitted.stub_count(StubKind::ReadSlow), 1);
    assert_eq!(emitted.stub_count(StubKind::WriteSlow), 1);
    assert_eq!(emitted.stub_count(StubKind::WriteNotify), 1);
    for stub in &emitted.stubs {
        assert!(stub.offset > emitted.entries[0].offset && stub.offset < emitted.end);
    }
    let read = emitted.stubs.iter().find(|s| s.kind == StubKind::ReadSlow).unwrap();
    assert_eq!(read.addr, BASE);
}

#[test]
fn test_without_fast_path_only_stubs_remain() {
    let p = prepare_mips(&[mips::lw(2, 4, 0), mips::sw(2, 4, 4), mips::jr(31), mips::nop()]);
    let (_, fast) = emit(&p);
    let config = EmitConfig::default().with_inline_fast_path(false);
    let (_, result) = emit_with(&p, &MemoryMap::new(), &config, 0x4000);
    let slow = result.unwrap();
    assert_eq!(slow.stub_count(StubKind::ReadSlow), 1);
    assert_eq!(slow.stub_count(StubKind::WriteSlow), 1);
    assert!(slow.size() < fast.size());
}

#[test]
fn test_constant_address_on_ram_is_direct() {
    let mut mem = GuestMemory::new();
    mem.map_ram(0, 0x1_0000).unwrap();
    let p = prepare_mips(&[mips::lw(2, 0, 0x100), mips::sw(2, 0, 0x104), mips::jr(31), mips::nop()]);

    let (_, result) = emit_with(&p, mem.map(), &EmitConfig::default(), 0x4000);
    let direct = result.unwrap();
    assert_eq!(direct.stub_count(StubKind::ReadSlow), 0);
    assert_eq!(direct.stub_count(StubKind::WriteSlow), 0);
    assert_eq!(direct.stub_count(StubKind::WriteNotify), 1);

    // unmapped: straight to the hooks, and no code can live there
    let (_, hooks) = emit(&p);
    assert_eq!(hooks.stub_count(StubKind::ReadSlow), 1);
    assert_eq!(hooks.stub_count(StubKind::WriteSlow), 1);
    assert_eq!(hooks.stub_count(StubKind::WriteNotify), 0);
}

#[test]
fn test_small_window_overflows() {
    let p = prepare_mips(&[mips::lw(2, 4, 0), mips::sw(2, 4, 4), mips::jr(31), mips::nop()]);
    let (code, result) = emit_with(&p, &MemoryMap::new(), &EmitConfig::default(), CODE_START + 16);
    assert!(matches!(result, Err(EmitError::Overflow { limit: 16, .. })));
    assert!(code[CODE_START + 16..].iter().all(|&b| b == 0));
}

#[test]
fn test_syscall_calls_exception_hook() {
    let p = prepare_mips(&[mips::addiu(2, 0, 1), mips::syscall()]);
    let (code, emitted) = emit(&p);
    assert!(find(&code[..emitted.end], &hook_call(CpuContext::EXCEPTION_HOOK_OFFSET)).is_some());
}

#[test]
fn test_divide_uses_fixed_registers() {
    let p = prepare_mips(&[mips::div(4, 5), mips::mflo(2), mips::jr(31), mips::nop()]);
    let (_, emitted) = emit(&p);
    assert_eq!(emitted.entries[0].addr, BASE);

    let mut moved = prepare_mips(&[mips::div(4, 5), mips::mflo(2), mips::jr(31), mips::nop()]);
    let cur = &mut moved.alloc.regs[0].cur;
    assert_eq!(cur.find(LO), Some(drc_ir::HOST_DIV_LO));
    cur.map.swap(drc_ir::HOST_DIV_LO, 7);
    let (_, result) = emit_with(&moved, &MemoryMap::new(), &EmitConfig::default(), 0x4000);
    assert!(matches!(result, Err(EmitError::DivideRegisters { addr: BASE })));
}

#[test]
fn test_sh2_block() {
    let p = prepare(
        IsaKind::Sh2,
        &sh2::assemble(&[sh2::mov_imm(1, 5), sh2::add(2, 1), sh2::rts(), sh2::nop()]),
        SH2_BASE,
    );
    let (_, emitted) = emit(&p);
    assert_eq!(emitted.entries[0].addr, SH2_BASE);
    assert_eq!(emitted.stub_count(StubKind::Exit), 1);
    assert!(emitted.links.is_empty());
}

#[test]
fn test_unsupported_instruction_calls_interpreter() {
    let p = prepare(
        IsaKind::Sh2,
        &sh2::assemble(&[sh2::addc(1, 2), sh2::rts(), sh2::nop()]),
        SH2_BASE,
    );
    let (code, emitted) = emit(&p);
    assert!(find(&code[..emitted.end], &hook_call(CpuContext::INTERP_HOOK_OFFSET)).is_some());
    // one exit when the interpreter asks to leave, one for rts
    assert_eq!(emitted.stub_count(StubKind::Exit), 2);
}

#[test]
fn test_sh2_conditional_branch_out() {
    let p = prepare(
        IsaKind::Sh2,
        &sh2::assemble(&[sh2::cmp_eq(1, 2), sh2::bt(-8), sh2::rts(), sh2::nop()]),
        SH2_BASE,
    );
    let (code, emitted) = emit(&p);
    let link = emitted.external_links().next().unwrap();
    assert_eq!(jump_target(&code, link.site), link.trampoline.unwrap());
}
