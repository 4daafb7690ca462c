#![forbid(unsafe_code)]

use ffx_ondisk::{
    DirSlot, Ext2Geometry, Ext2GroupDesc, Ext2Inode, Ext2Superblock, GroupTable, indirect_pointers,
    iter_dir_block,
};
use ffx_types::{EXT2_SUPER_MAGIC, ParseError, SUPERBLOCK_SIZE};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_field: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
        }
    }
}

/// Deterministic xorshift64 so the corpus is identical on every run.
struct Xorshift(u64);

impl Xorshift {
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let word = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

fn generate_samples() -> Vec<(String, Vec<u8>)> {
    let mut rng = Xorshift(0x9E37_79B9_7F4A_7C15);
    let mut out = Vec::new();

    for len in [0_usize, 1, 7, 8, 9, 31, 32, 127, 128, 512, 1023, 1024, 4096] {
        let mut random = vec![0_u8; len];
        rng.fill(&mut random);
        out.push((format!("random_{len}"), random));
        out.push((format!("zeros_{len}"), vec![0_u8; len]));
        out.push((format!("ones_{len}"), vec![0xFF_u8; len]));
    }

    // superblock-shaped: correct magic, garbage everywhere else
    for seed in 0..16_u8 {
        let mut sb = vec![0_u8; SUPERBLOCK_SIZE];
        rng.fill(&mut sb);
        sb[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        sb[0x18] = seed % 24;
        out.push((format!("sb_magic_{seed}"), sb));
    }

    out
}

fn run_parser<T, F>(
    sample_name: &str,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
    parser: F,
) where
    F: FnOnce() -> Result<T, ParseError>,
{
    let result = catch_unwind(AssertUnwindSafe(parser));
    let Ok(result) = result else {
        panic!("parser {parser_name} panicked on sample {sample_name}");
    };
    *parser_hits.entry(parser_name).or_default() += 1;
    if let Err(err) = result {
        coverage.observe(&err);
    }
}

#[test]
fn parsers_never_panic_on_adversarial_samples() {
    let samples = generate_samples();
    assert!(samples.len() >= 50, "corpus too small: {}", samples.len());

    let mut hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();

    for (name, data) in &samples {
        run_parser(name, "superblock", &mut hits, &mut coverage, || {
            let sb = Ext2Superblock::parse_superblock_region(data)?;
            let _ = sb.violations(data.len() as u64);
            let _ = sb.groups_count();
            let _ = sb.group_desc_table_offset();
            if let Ok(geo) = Ext2Geometry::from_superblock(sb, u64::MAX) {
                // a table built from the sample itself, usually too short
                let _ = GroupTable::decode(&geo, data);
            }
            Ok(())
        });
        run_parser(name, "group_desc", &mut hits, &mut coverage, || {
            Ext2GroupDesc::parse_from_bytes(data)
        });
        run_parser(name, "inode", &mut hits, &mut coverage, || {
            let inode = Ext2Inode::parse_from_bytes(data)?;
            let _ = inode.kind().tag();
            let _ = inode.halved_block_count();
            Ok(inode)
        });
        run_parser(name, "dir_block", &mut hits, &mut coverage, || {
            let mut last_err = None;
            for slot in iter_dir_block(data) {
                match slot {
                    Ok(DirSlot::Live { name, name_len, .. }) => {
                        assert_eq!(name.len(), usize::from(name_len));
                    }
                    Ok(DirSlot::Deleted { .. }) => {}
                    Err(err) => last_err = Some(err),
                }
            }
            last_err.map_or(Ok(()), Err)
        });
        run_parser(name, "indirect", &mut hits, &mut coverage, || {
            let ptrs = indirect_pointers(data);
            assert!(ptrs.len() <= data.len() / 4);
            assert!(ptrs.iter().all(|p| !p.is_null()));
            Ok(())
        });
    }

    for parser in ["superblock", "group_desc", "inode", "dir_block", "indirect"] {
        assert_eq!(hits.get(parser).copied(), Some(samples.len() as u32));
    }
    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_field > 0, "{coverage:?}");
}
