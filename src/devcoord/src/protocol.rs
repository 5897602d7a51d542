// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device protocol identifiers.
//!
//! A protocol id is a four character code packed big-endian into a `u32`
//! (`b"pBLK"` is `0x70424c4b`).

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Pack a four character code.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | (code[3] as u32)
}

/// The protocol is not aliased under `/dev/class`.
pub const PF_NOPUB: u32 = 1;

pub const PROTOCOL_BLOCK: u32 = fourcc(b"pBLK");
pub const PROTOCOL_CONSOLE: u32 = fourcc(b"pCON");
pub const PROTOCOL_DEVICE: u32 = fourcc(b"pDEV");
pub const PROTOCOL_ETHERNET: u32 = fourcc(b"pETH");
pub const PROTOCOL_GPIO: u32 = fourcc(b"pGPO");
pub const PROTOCOL_HIDBUS: u32 = fourcc(b"pHID");
pub const PROTOCOL_I2C: u32 = fourcc(b"pI2C");
pub const PROTOCOL_INPUT: u32 = fourcc(b"pINP");
pub const PROTOCOL_ROOT: u32 = fourcc(b"pAAA");
pub const PROTOCOL_MISC: u32 = fourcc(b"pMSC");
pub const PROTOCOL_MISC_PARENT: u32 = fourcc(b"pMSP");
pub const PROTOCOL_ACPI: u32 = fourcc(b"pACP");
pub const PROTOCOL_PCI: u32 = fourcc(b"pPCI");
pub const PROTOCOL_PCIROOT: u32 = fourcc(b"pPRT");
pub const PROTOCOL_USB: u32 = fourcc(b"pUSB");
pub const PROTOCOL_USB_BUS: u32 = fourcc(b"pUBS");
pub const PROTOCOL_USB_DEVICE: u32 = fourcc(b"pUSD");
pub const PROTOCOL_USB_HCI: u32 = fourcc(b"pUHI");
pub const PROTOCOL_PLATFORM_DEV: u32 = fourcc(b"pPDV");
pub const PROTOCOL_TEST: u32 = fourcc(b"pTST");
pub const PROTOCOL_TEST_PARENT: u32 = fourcc(b"pTSP");

const PROTOCOLS: &[(u32, &str, u32)] = &[
    (PROTOCOL_BLOCK, "block", 0),
    (PROTOCOL_CONSOLE, "console", 0),
    (PROTOCOL_DEVICE, "device", 0),
    (PROTOCOL_ETHERNET, "ethernet", 0),
    (PROTOCOL_GPIO, "gpio", PF_NOPUB),
    (PROTOCOL_HIDBUS, "hidbus", 0),
    (PROTOCOL_I2C, "i2c", 0),
    (PROTOCOL_INPUT, "input", 0),
    (PROTOCOL_ROOT, "root", PF_NOPUB),
    (PROTOCOL_MISC, "misc", PF_NOPUB),
    (PROTOCOL_MISC_PARENT, "misc-parent", PF_NOPUB),
    (PROTOCOL_ACPI, "acpi", 0),
    (PROTOCOL_PCI, "pci", 0),
    (PROTOCOL_PCIROOT, "pci-root", PF_NOPUB),
    (PROTOCOL_USB, "usb", PF_NOPUB),
    (PROTOCOL_USB_BUS, "usb-bus", PF_NOPUB),
    (PROTOCOL_USB_DEVICE, "usb-device", 0),
    (PROTOCOL_USB_HCI, "usb-hci", 0),
    (PROTOCOL_PLATFORM_DEV, "platform-dev", PF_NOPUB),
    (PROTOCOL_TEST, "test", 0),
    (PROTOCOL_TEST_PARENT, "test-parent", PF_NOPUB),
];

lazy_static! {
    static ref PROTOCOL_BY_ID: HashMap<u32, (&'static str, u32)> = PROTOCOLS
        .iter()
        .map(|(id, name, flags)| (*id, (*name, *flags)))
        .collect();
}

/// Name of a known protocol.
pub fn protocol_name(id: u32) -> Option<&'static str> {
    PROTOCOL_BY_ID.get(&id).map(|(name, _)| *name)
}

/// Whether devices of this protocol get a `/dev/class/<name>` alias.
pub fn is_publishable(id: u32) -> bool {
    matches!(PROTOCOL_BY_ID.get(&id), Some((_, flags)) if flags & PF_NOPUB == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc() {
        assert_eq!(PROTOCOL_BLOCK, 0x70424c4b);
        assert_eq!(protocol_name(PROTOCOL_PCI), Some("pci"));
        assert_eq!(protocol_name(fourcc(b"zzzz")), None);
    }

    #[test]
    fn test_publishable() {
        assert!(is_publishable(PROTOCOL_BLOCK));
        assert!(!is_publishable(PROTOCOL_ROOT));
        assert!(!is_publishable(fourcc(b"zzzz")));
    }
}
