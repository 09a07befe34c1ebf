use snappatch::addrs::PhysAddr;
use snappatch::controller::write_address_file;
use snappatch::patcher::CMP_PATCH;
use snappatch::prelude::*;
use snappatch::{Config, PatchInfo};

const CR3: Cr3 = Cr3(0x1000);
const VCPU: Vcpu = Vcpu::new(0, CR3);

const CODE: VirtAddr = VirtAddr(0x40_1000);
const DATA: VirtAddr = VirtAddr(0x60_0000);

/// `cmp eax, 0x12345678` placed across the boundary of the two code pages
const STRADDLE: VirtAddr = VirtAddr(0x40_1ffd);

/// Compare instructions and their offset from [`CODE`]
const COMPARES: &[(u64, &[u8])] = &[
    // cmp al, bl
    (0, &[0x38, 0xd8]),
    // cmp eax, 0x12345678
    (2, &[0x3d, 0x78, 0x56, 0x34, 0x12]),
    // cmp rcx, 0xffffffffdeadbeef
    (7, &[0x48, 0x81, 0xf9, 0xef, 0xbe, 0xad, 0xde]),
    // test al, al
    (14, &[0x84, 0xc0]),
    // ret
    (16, &[0xc3]),
];

/// Build a guest with two mapped code pages and one data page
fn guest() -> Memory {
    let mut memory = Memory::zeroed(0x40_000);
    memory.set_next_avail_phys_page(PhysAddr(0x2000));

    for page in [CODE, VirtAddr(CODE.0 + 0x1000), DATA] {
        memory.map_virt_addr_4k(page, CR3).unwrap();
    }

    for (offset, bytes) in COMPARES {
        memory
            .write_bytes(VirtAddr(CODE.0 + offset), bytes, VCPU)
            .unwrap();
    }

    memory
        .write_bytes(STRADDLE, &[0x3d, 0x78, 0x56, 0x34, 0x12, 0xc3], VCPU)
        .unwrap();

    memory.dirty_pages.clear();
    memory
}

fn compare_addrs() -> Vec<VirtAddr> {
    COMPARES
        .iter()
        .filter(|(_, bytes)| bytes.len() > 1)
        .map(|(offset, _)| VirtAddr(CODE.0 + offset))
        .chain(std::iter::once(STRADDLE))
        .collect()
}

fn read(memory: &Memory, addr: VirtAddr, size: usize) -> Vec<u8> {
    let mut bytes = vec![0; size];
    memory.read_bytes(addr, &mut bytes, VCPU).unwrap();
    bytes
}

#[test]
fn every_compare_is_patched_to_its_own_length() {
    let mut memory = guest();
    let before = memory.as_bytes().to_vec();

    let mut patcher = Patcher::new(VCPU);
    let skipped = patcher
        .set_addresses(&mut memory, &compare_addrs())
        .unwrap();
    assert!(skipped.is_empty());

    patcher.apply_all(&mut memory).unwrap();

    for info in patcher.records() {
        assert_eq!(
            read(&memory, info.addr(), info.size()),
            CMP_PATCH[..info.size()].to_vec()
        );
    }

    // The trailing `ret` instructions were never touched
    assert_eq!(read(&memory, VirtAddr(CODE.0 + 16), 1), vec![0xc3]);
    assert_eq!(read(&memory, VirtAddr(STRADDLE.0 + 5), 1), vec![0xc3]);

    patcher.restore_all(&mut memory).unwrap();
    assert_eq!(memory.as_bytes(), &before[..]);
}

#[test]
fn snapshot_file_patch_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let physmem = dir.path().join("snapshot.physmem");

    let clean = guest().as_bytes().to_vec();
    std::fs::write(&physmem, &clean).unwrap();

    // Patch the file and keep only the serialized records
    let saved = {
        let mut memory = Memory::from_file(&physmem).unwrap();
        let mut patcher = Patcher::new(VCPU);
        patcher
            .set_addresses(&mut memory, &compare_addrs())
            .unwrap();
        patcher.apply_all(&mut memory).unwrap();
        memory.flush().unwrap();

        let records: Vec<PatchInfo> = patcher.records().cloned().collect();
        serde_json::to_string(&records).unwrap()
    };

    assert_ne!(std::fs::read(&physmem).unwrap(), clean);

    // Restore from the records alone
    let mut memory = Memory::from_file(&physmem).unwrap();
    let records: Vec<PatchInfo> = serde_json::from_str(&saved).unwrap();
    let mut patcher = Patcher::from_records(VCPU, records, true);

    assert_eq!(patcher.validate(&memory), Validation::Consistent);
    patcher.restore_all(&mut memory).unwrap();
    memory.flush().unwrap();
    drop(memory);

    assert_eq!(std::fs::read(&physmem).unwrap(), clean);
}

#[test]
fn patches_survive_many_snapshot_resets() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.workdir.base = dir.path().to_path_buf();

    let mut controller = PatchController::new(VCPU, &config).unwrap();
    controller.workdir().init_dir().unwrap();
    write_address_file(&controller.workdir().patches(), &compare_addrs()).unwrap();

    let mut memory = guest();
    let clean = memory.as_bytes().to_vec();

    controller.enable(&mut memory).unwrap();

    for iteration in 0_u32..2000 {
        controller
            .run_slice(&mut memory, &mut NoTrace, |memory| {
                // The guest writes its input buffer
                memory
                    .write_bytes(DATA, &iteration.to_le_bytes(), VCPU)
                    .unwrap();
            })
            .unwrap();

        assert!(controller.patcher().validate_patches(&memory));
        memory.reset_dirty_pages(&clean).unwrap();
    }

    controller.prepare_iteration(&mut memory).unwrap();
    controller.disable(&mut memory).unwrap();

    assert_eq!(memory.as_bytes(), &clean[..]);
}

#[test]
fn changed_address_list_leaves_no_stale_patches() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.workdir.base = dir.path().to_path_buf();
    config.workdir.id = 1;

    let mut controller = PatchController::new(VCPU, &config).unwrap();
    controller.workdir().init_dir().unwrap();

    let addrs = compare_addrs();
    let mut memory = guest();
    let clean = memory.as_bytes().to_vec();

    write_address_file(&controller.workdir().patches(), &addrs[..2]).unwrap();
    controller.enable(&mut memory).unwrap();

    write_address_file(&controller.workdir().patches(), &addrs[2..]).unwrap();
    controller.reload(&mut memory).unwrap();

    // The first list is back to its original bytes
    assert_eq!(read(&memory, addrs[0], 2), vec![0x38, 0xd8]);
    assert_eq!(read(&memory, addrs[1], 5), vec![0x3d, 0x78, 0x56, 0x34, 0x12]);

    controller.disable(&mut memory).unwrap();
    assert_eq!(memory.as_bytes(), &clean[..]);
}

#[test]
fn empty_address_list_unpatches_everything() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.workdir.base = dir.path().to_path_buf();

    let mut controller = PatchController::new(VCPU, &config).unwrap();
    controller.workdir().init_dir().unwrap();

    let mut memory = guest();
    let clean = memory.as_bytes().to_vec();

    write_address_file(&controller.workdir().patches(), &compare_addrs()).unwrap();
    controller.enable(&mut memory).unwrap();

    write_address_file(&controller.workdir().patches(), &[]).unwrap();
    controller.enable(&mut memory).unwrap();

    assert!(controller.patcher().is_empty());
    assert_eq!(memory.as_bytes(), &clean[..]);
}
