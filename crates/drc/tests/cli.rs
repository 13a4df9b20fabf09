//! End-to-end runs of the `drc` binary on images written to a temp dir.

use std::path::Path;
use std::process::{Command, Output};

use drc_isa::encode::{mips, sh2};

fn drc(args: &[&str], image: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_drc"))
        .args(args.iter().take(1))
        .arg(image)
        .args(args.iter().skip(1))
        .arg("--silent")
        .output()
        .unwrap()
}

fn write_image(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn test_translate_follows_direct_jumps() {
    let dir = tempfile::tempdir().unwrap();
    let mut words = vec![mips::addiu(2, 0, 1), mips::j(0x8000_0100), mips::nop()];
    words.resize(0x40, mips::nop());
    words.extend([mips::addiu(3, 0, 2), mips::jr(31), mips::nop()]);
    let image = write_image(&dir, "mips.bin", &mips::assemble(&words));

    let out = drc(&["translate", "--isa", "mips", "--base", "0x80000000", "--follow", "4"], &image);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "{stdout}");
    assert!(lines[0].starts_with("0x80000000..0x8000000c mips"));
    assert!(lines[1].starts_with("0x80000100..0x8000010c mips"));
    assert!(lines[2].starts_with("2 blocks"));
    // links are patched lazily, on first execution
    assert!(lines[2].ends_with("0 links patched"));
}

#[test]
fn test_dump_prints_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let words = [sh2::mov_imm(1, 5), sh2::add(2, 1), sh2::rts(), sh2::nop()];
    let image = write_image(&dir, "sh2.bin", &sh2::assemble(&words));

    let out = drc(&["dump", "--isa", "sh2", "--base", "0x06000000", "--entry", "0x06000000"], &image);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.starts_with("block 0x06000000..0x06000008 sh2 4 instrs"));
    assert_eq!(stdout.lines().count(), 5);
    assert!(stdout.contains("regs h"));
}

#[test]
fn test_missing_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = drc(&["translate", "--isa", "mips", "--base", "0"], &dir.path().join("missing.bin"));
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stdout.is_empty());
}

#[test]
fn test_unmapped_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "tiny.bin", &mips::assemble(&[mips::jr(31), mips::nop()]));
    let out = drc(&["translate", "--isa", "mips", "--base", "0x80000000", "--entry", "0x90000000"], &image);
    assert_eq!(out.status.code(), Some(1));
}
