//! Minimal HID report descriptor scanner.
//!
//! Only walks short items far enough to learn the largest input, output and
//! feature report and whether the device numbers its reports. Usage pages,
//! logical ranges and collections are skipped.

use std::collections::HashMap;

/// Report sizes in bytes, each including the leading report-ID byte (which
/// is `0` for devices without report IDs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportInfo {
    pub max_input_len: usize,
    pub max_output_len: usize,
    pub max_feature_len: usize,
    pub uses_report_ids: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Input,
    Output,
    Feature,
}

#[derive(Clone, Copy, Default)]
struct Globals {
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;

const MAIN_INPUT: u8 = 0x8;
const MAIN_OUTPUT: u8 = 0x9;
const MAIN_FEATURE: u8 = 0xB;

const GLOBAL_REPORT_SIZE: u8 = 0x7;
const GLOBAL_REPORT_ID: u8 = 0x8;
const GLOBAL_REPORT_COUNT: u8 = 0x9;
const GLOBAL_PUSH: u8 = 0xA;
const GLOBAL_POP: u8 = 0xB;

const LONG_ITEM_PREFIX: u8 = 0xFE;

/// Largest report the kernel will hand us (`HID_MAX_BUFFER_SIZE`), in bits.
const MAX_REPORT_BITS: u32 = 16384 * 8;

fn item_value(data: &[u8]) -> u32 {
    data.iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (b as u32) << (8 * i))
}

impl ReportInfo {
    /// Scan a raw report descriptor. Truncated trailing items are ignored.
    pub fn parse(descriptor: &[u8]) -> Self {
        let mut globals = Globals::default();
        let mut stack: Vec<Globals> = Vec::new();
        let mut bits: HashMap<(Kind, u8), u32> = HashMap::new();
        let mut uses_report_ids = false;

        let mut i = 0;
        while i < descriptor.len() {
            let prefix = descriptor[i];
            if prefix == LONG_ITEM_PREFIX {
                let Some(&len) = descriptor.get(i + 1) else {
                    break;
                };
                i += 3 + len as usize;
                continue;
            }
            let size = match prefix & 0x3 {
                3 => 4,
                n => n as usize,
            };
            let item_type = (prefix >> 2) & 0x3;
            let tag = prefix >> 4;
            let Some(data) = descriptor.get(i + 1..i + 1 + size) else {
                break;
            };
            let value = item_value(data);

            match (item_type, tag) {
                (TYPE_GLOBAL, GLOBAL_REPORT_SIZE) => globals.report_size = value,
                (TYPE_GLOBAL, GLOBAL_REPORT_COUNT) => globals.report_count = value,
                (TYPE_GLOBAL, GLOBAL_REPORT_ID) => {
                    globals.report_id = value as u8;
                    uses_report_ids = true;
                }
                (TYPE_GLOBAL, GLOBAL_PUSH) => stack.push(globals),
                (TYPE_GLOBAL, GLOBAL_POP) => {
                    if let Some(g) = stack.pop() {
                        globals = g;
                    }
                }
                (TYPE_MAIN, MAIN_INPUT | MAIN_OUTPUT | MAIN_FEATURE) => {
                    let kind = match tag {
                        MAIN_INPUT => Kind::Input,
                        MAIN_OUTPUT => Kind::Output,
                        _ => Kind::Feature,
                    };
                    let item_bits = globals.report_size.saturating_mul(globals.report_count);
                    let total = bits.entry((kind, globals.report_id)).or_default();
                    *total = total.saturating_add(item_bits).min(MAX_REPORT_BITS);
                }
                _ => {}
            }
            i += 1 + size;
        }

        let max_len = |kind: Kind| {
            bits.iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, &b)| (b as usize).div_ceil(8) + 1)
                .max()
                .unwrap_or(0)
        };

        ReportInfo {
            max_input_len: max_len(Kind::Input),
            max_output_len: max_len(Kind::Output),
            max_feature_len: max_len(Kind::Feature),
            uses_report_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boot keyboard: 8-byte input, 1-byte LED output, no report IDs.
    const KEYBOARD: &[u8] = &[
        0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25,
        0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x01, 0x95, 0x05,
        0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, 0x95, 0x01, 0x75, 0x03, 0x91,
        0x01, 0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0x65, 0x05, 0x07, 0x19, 0x00, 0x29, 0x65,
        0x81, 0x00, 0xC0,
    ];

    #[test]
    fn keyboard_lengths() {
        let info = ReportInfo::parse(KEYBOARD);
        assert_eq!(info.max_input_len, 9);
        assert_eq!(info.max_output_len, 2);
        assert_eq!(info.max_feature_len, 0);
        assert!(!info.uses_report_ids);
    }

    #[test]
    fn report_ids_take_largest_report() {
        // Vendor page, two input reports (IDs 1 and 2) and one 64-byte feature report.
        let desc = [
            0x06, 0x00, 0xFF, 0x09, 0x01, 0xA1, 0x01, //
            0x85, 0x01, 0x75, 0x08, 0x95, 0x04, 0x81, 0x02, // id 1: 4 bytes in
            0x85, 0x02, 0x75, 0x08, 0x95, 0x10, 0x81, 0x02, // id 2: 16 bytes in
            0x85, 0x03, 0x75, 0x08, 0x95, 0x40, 0xB1, 0x02, // id 3: 64 bytes feature
            0xC0,
        ];
        let info = ReportInfo::parse(&desc);
        assert!(info.uses_report_ids);
        assert_eq!(info.max_input_len, 17);
        assert_eq!(info.max_feature_len, 65);
        assert_eq!(info.max_output_len, 0);
    }

    #[test]
    fn push_pop_restores_globals() {
        let desc = [
            0x75, 0x08, 0x95, 0x02, // 2 bytes
            0xA4, // push
            0x95, 0x08, 0x81, 0x02, // 8 bytes in
            0xB4, // pop
            0x91, 0x02, // 2 bytes out
        ];
        let info = ReportInfo::parse(&desc);
        assert_eq!(info.max_input_len, 9);
        assert_eq!(info.max_output_len, 3);
    }

    #[test]
    fn truncated_descriptor_is_tolerated() {
        let info = ReportInfo::parse(&[0x75, 0x08, 0x96, 0x40]);
        assert_eq!(info, ReportInfo::default());
    }

    #[test]
    fn oversized_reports_are_clamped() {
        // Report size and count of u32::MAX, two input items.
        let desc = [
            0x77, 0xFF, 0xFF, 0xFF, 0xFF, 0x97, 0xFF, 0xFF, 0xFF, 0xFF, 0x81, 0x00, 0x81, 0x00,
        ];
        let info = ReportInfo::parse(&desc);
        assert_eq!(info.max_input_len, 16384 + 1);
        assert_eq!(info.max_output_len, 0);
    }

    #[test]
    fn long_items_are_skipped() {
        let desc = [0xFE, 0x02, 0x10, 0xAA, 0xBB, 0x75, 0x08, 0x95, 0x03, 0x81, 0x02];
        assert_eq!(ReportInfo::parse(&desc).max_input_len, 4);
    }
}
