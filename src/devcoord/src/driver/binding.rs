// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Byte-coded binding programs.
//!
//! An instruction is a pair of 32-bit words. The first packs a condition, an
//! opcode and two parameters:
//!
//! ```text
//!  31    28 27    24 23            16 15                             0
//! +--------+--------+----------------+--------------------------------+
//! |  cond  | opcode |    param a     |            param b             |
//! +--------+--------+----------------+--------------------------------+
//! ```
//!
//! Conditions compare the device property named by `param b` with the
//! second word. The program matches when a MATCH executes and fails on ABORT
//! or when execution runs off the end.

use crate::device::DeviceProp;
use crate::error::{Error, Result};

pub const COND_AL: u32 = 0;
pub const COND_EQ: u32 = 1;
pub const COND_NE: u32 = 2;
pub const COND_GT: u32 = 3;
pub const COND_LT: u32 = 4;
pub const COND_GE: u32 = 5;
pub const COND_LE: u32 = 6;
pub const COND_MASK: u32 = 7;
pub const COND_BITS: u32 = 8;

pub const OP_ABORT: u32 = 0;
pub const OP_MATCH: u32 = 1;
pub const OP_GOTO: u32 = 2;
pub const OP_SET: u32 = 3;
pub const OP_CLEAR: u32 = 4;
pub const OP_LABEL: u32 = 5;

/// Program flag register.
pub const BIND_FLAGS: u32 = 0x0000;
pub const BIND_PROTOCOL: u32 = 0x0001;
pub const BIND_AUTOBIND: u32 = 0x0002;

pub const BIND_PCI_VID: u16 = 0x0100;
pub const BIND_PCI_DID: u16 = 0x0101;
pub const BIND_PCI_CLASS: u16 = 0x0102;
pub const BIND_USB_VID: u16 = 0x0200;
pub const BIND_USB_PID: u16 = 0x0201;
pub const BIND_USB_CLASS: u16 = 0x0202;
pub const BIND_PLATFORM_DEV_VID: u16 = 0x0300;
pub const BIND_PLATFORM_DEV_PID: u16 = 0x0301;
pub const BIND_PLATFORM_DEV_DID: u16 = 0x0302;

const INST_SIZE: usize = 8;

/// One binding instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindInst {
    pub op: u32,
    pub arg: u32,
}

impl BindInst {
    pub const fn new(cond: u32, opcode: u32, param_a: u32, param_b: u32, value: u32) -> Self {
        BindInst {
            op: ((cond & 0xF) << 28)
                | ((opcode & 0xF) << 24)
                | ((param_a & 0xFF) << 16)
                | (param_b & 0xFFFF),
            arg: value,
        }
    }

    pub fn cond(&self) -> u32 {
        self.op >> 28
    }

    pub fn opcode(&self) -> u32 {
        (self.op >> 24) & 0xF
    }

    pub fn param_a(&self) -> u32 {
        (self.op >> 16) & 0xFF
    }

    pub fn param_b(&self) -> u32 {
        self.op & 0xFFFF
    }

    pub const fn match_always() -> Self {
        BindInst::new(COND_AL, OP_MATCH, 0, 0, 0)
    }

    pub const fn abort_always() -> Self {
        BindInst::new(COND_AL, OP_ABORT, 0, 0, 0)
    }

    pub const fn match_if(cond: u32, prop: u32, value: u32) -> Self {
        BindInst::new(cond, OP_MATCH, 0, prop, value)
    }

    pub const fn abort_if(cond: u32, prop: u32, value: u32) -> Self {
        BindInst::new(cond, OP_ABORT, 0, prop, value)
    }

    pub const fn goto_if(cond: u32, prop: u32, value: u32, label: u32) -> Self {
        BindInst::new(cond, OP_GOTO, label, prop, value)
    }

    pub const fn label(label: u32) -> Self {
        BindInst::new(COND_AL, OP_LABEL, label, 0, 0)
    }

    pub const fn set(flag: u32) -> Self {
        BindInst::new(COND_AL, OP_SET, flag, 0, 0)
    }

    pub const fn clear(flag: u32) -> Self {
        BindInst::new(COND_AL, OP_CLEAR, flag, 0, 0)
    }

    fn is_legal(&self) -> bool {
        self.cond() <= COND_BITS && self.opcode() <= OP_LABEL
    }
}

/// What a binding program is evaluated against.
#[derive(Clone, Copy, Debug)]
pub struct BindContext<'a> {
    pub protocol_id: u32,
    pub props: &'a [DeviceProp],
    pub autobind: bool,
}

impl<'a> BindContext<'a> {
    fn prop(&self, id: u32) -> u32 {
        if let Some(p) = self.props.iter().find(|p| u32::from(p.id) == id) {
            return p.value;
        }
        match id {
            BIND_PROTOCOL => self.protocol_id,
            BIND_AUTOBIND => self.autobind as u32,
            _ => 0,
        }
    }
}

/// A validated binding program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindProgram {
    insts: Vec<BindInst>,
}

impl BindProgram {
    pub fn new(insts: Vec<BindInst>) -> Result<Self> {
        if insts.is_empty() {
            return Err(Error::BadBinding("empty binding program".to_string()));
        }
        if let Some((idx, inst)) = insts.iter().enumerate().find(|(_, i)| !i.is_legal()) {
            return Err(Error::BadBinding(format!(
                "illegal instruction {:#010x} at {}",
                inst.op, idx
            )));
        }
        Ok(BindProgram { insts })
    }

    /// Decode little-endian `[op, arg]` pairs.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % INST_SIZE != 0 {
            return Err(Error::BadBinding(format!(
                "binding size {} is not a multiple of {}",
                bytes.len(),
                INST_SIZE
            )));
        }
        let insts = bytes
            .chunks_exact(INST_SIZE)
            .map(|c| BindInst {
                op: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                arg: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            })
            .collect();
        BindProgram::new(insts)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.insts
            .iter()
            .flat_map(|i| {
                let mut word = i.op.to_le_bytes().to_vec();
                word.extend_from_slice(&i.arg.to_le_bytes());
                word
            })
            .collect()
    }

    pub fn instructions(&self) -> &[BindInst] {
        &self.insts
    }

    /// Run the program. Evaluation is a pure function of the program and the
    /// context, so repeated evaluation always selects the same drivers.
    pub fn evaluate(&self, ctx: &BindContext) -> bool {
        if ctx.props.len() > crate::device::DEVICE_PROPS_MAX {
            return false;
        }

        let mut flags: u32 = 0;
        let mut ip = 0;
        while ip < self.insts.len() {
            let inst = self.insts[ip];
            let cond = match inst.cond() {
                COND_AL => true,
                cc => {
                    let pid = inst.param_b();
                    let pval = if pid == BIND_FLAGS { flags } else { ctx.prop(pid) };
                    let value = inst.arg;
                    match cc {
                        COND_EQ => pval == value,
                        COND_NE => pval != value,
                        COND_GT => pval > value,
                        COND_LT => pval < value,
                        COND_GE => pval >= value,
                        COND_LE => pval <= value,
                        COND_MASK => pval & value != 0,
                        COND_BITS => pval & value == value,
                        _ => return false,
                    }
                }
            };

            if cond {
                match inst.opcode() {
                    OP_ABORT => return false,
                    OP_MATCH => return true,
                    OP_GOTO => {
                        let label = inst.param_a();
                        match self.insts[ip + 1..].iter().position(|i| {
                            i.opcode() == OP_LABEL && i.param_a() == label
                        }) {
                            Some(offset) => ip += offset + 1,
                            None => return false,
                        }
                    }
                    OP_SET => flags |= inst.param_a(),
                    OP_CLEAR => flags &= !inst.param_a(),
                    OP_LABEL => {}
                    _ => return false,
                }
            }
            ip += 1;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PROTOCOL_PCI, PROTOCOL_USB};

    fn pci_program() -> BindProgram {
        BindProgram::new(vec![
            BindInst::abort_if(COND_NE, BIND_PROTOCOL, PROTOCOL_PCI),
            BindInst::abort_if(COND_NE, BIND_PCI_VID as u32, 0x8086),
            BindInst::match_if(COND_EQ, BIND_PCI_DID as u32, 0x100e),
        ])
        .unwrap()
    }

    fn ctx(protocol_id: u32, props: &[DeviceProp]) -> BindContext<'_> {
        BindContext {
            protocol_id,
            props,
            autobind: true,
        }
    }

    #[test]
    fn test_encoding() {
        let inst = BindInst::new(COND_EQ, OP_GOTO, 0x12, 0x3456, 7);
        assert_eq!(inst.op, 0x1212_3456);
        assert_eq!(inst.cond(), COND_EQ);
        assert_eq!(inst.opcode(), OP_GOTO);
        assert_eq!(inst.param_a(), 0x12);
        assert_eq!(inst.param_b(), 0x3456);
    }

    #[test]
    fn test_match_on_properties() {
        let program = pci_program();
        let props = [
            DeviceProp::new(BIND_PCI_VID, 0x8086),
            DeviceProp::new(BIND_PCI_DID, 0x100e),
        ];
        assert!(program.evaluate(&ctx(PROTOCOL_PCI, &props)));
        assert!(!program.evaluate(&ctx(PROTOCOL_USB, &props)));

        let other = [
            DeviceProp::new(BIND_PCI_VID, 0x10ec),
            DeviceProp::new(BIND_PCI_DID, 0x100e),
        ];
        assert!(!program.evaluate(&ctx(PROTOCOL_PCI, &other)));
        // Missing properties read as zero.
        assert!(!program.evaluate(&ctx(PROTOCOL_PCI, &[])));
    }

    #[test]
    fn test_goto_and_flags() {
        let program = BindProgram::new(vec![
            BindInst::goto_if(COND_EQ, BIND_PROTOCOL, PROTOCOL_USB, 1),
            BindInst::abort_always(),
            BindInst::label(1),
            BindInst::set(0x4),
            BindInst::match_if(COND_BITS, BIND_FLAGS, 0x4),
        ])
        .unwrap();
        assert!(program.evaluate(&ctx(PROTOCOL_USB, &[])));
        assert!(!program.evaluate(&ctx(PROTOCOL_PCI, &[])));

        let missing_label = BindProgram::new(vec![
            BindInst::goto_if(COND_AL, 0, 0, 9),
            BindInst::match_always(),
        ])
        .unwrap();
        assert!(!missing_label.evaluate(&ctx(PROTOCOL_USB, &[])));
    }

    #[test]
    fn test_autobind_property() {
        let program = BindProgram::new(vec![
            BindInst::abort_if(COND_EQ, BIND_AUTOBIND, 1),
            BindInst::match_always(),
        ])
        .unwrap();
        let mut c = ctx(PROTOCOL_PCI, &[]);
        assert!(!program.evaluate(&c));
        c.autobind = false;
        assert!(program.evaluate(&c));
    }

    #[test]
    fn test_falls_off_end() {
        let program = BindProgram::new(vec![BindInst::set(1)]).unwrap();
        assert!(!program.evaluate(&ctx(PROTOCOL_PCI, &[])));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            BindProgram::new(vec![]),
            Err(Error::BadBinding(_))
        ));
        assert!(BindProgram::new(vec![BindInst { op: 0x9100_0000, arg: 0 }]).is_err());
        assert!(BindProgram::new(vec![BindInst { op: 0x0700_0000, arg: 0 }]).is_err());
        assert!(BindProgram::from_bytes(&[0u8; 7]).is_err());

        let program = pci_program();
        assert_eq!(BindProgram::from_bytes(&program.to_bytes()).unwrap(), program);
    }
}
