// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! GITS_* register layout, field helpers and the BASER/CBASER sanitisers.

/*
 * ITS control frame registers, offsets from ITS_base
 */
pub const GITS_CTLR: u64 = 0x0000;
pub const GITS_IIDR: u64 = 0x0004;
pub const GITS_TYPER: u64 = 0x0008;
pub const GITS_CBASER: u64 = 0x0080;
pub const GITS_CWRITER: u64 = 0x0088;
pub const GITS_CREADR: u64 = 0x0090;
pub const GITS_BASER: u64 = 0x0100;
pub const GITS_BASER_NR_REGS: u64 = 8;
pub const GITS_IDREGS_BASE: u64 = 0xffd0;

pub const GITS_PIDR4: u64 = 0xffd0;
pub const GITS_PIDR0: u64 = 0xffe0;
pub const GITS_PIDR1: u64 = 0xffe4;
pub const GITS_PIDR2: u64 = 0xffe8;
pub const GITS_CIDR0: u64 = 0xfff0;
pub const GITS_CIDR1: u64 = 0xfff4;
pub const GITS_CIDR2: u64 = 0xfff8;
pub const GITS_CIDR3: u64 = 0xfffc;

/* Translation frame, second 64K page */
pub const GITS_TRANSLATER: u64 = 0x1_0040;

/// Size of the MMIO window: control frame plus translation frame.
pub const ITS_MMIO_SIZE: u64 = 0x2_0000;

/// The ITS base address has to be aligned to its 64K frame.
pub const ITS_BASE_ALIGN: u64 = 0x1_0000;

pub const GITS_CTLR_ENABLE: u32 = 1 << 0;
pub const GITS_CTLR_QUIESCENT: u32 = 1 << 31;

const IMPLEMENTER_ARM: u32 = 0x43b;
const GITS_IIDR_PRODUCT_ID: u32 = 0x4b;
const GITS_IIDR_PRODUCTID_SHIFT: u32 = 24;
pub const GITS_IIDR_REV_SHIFT: u32 = 12;
pub const GITS_IIDR_REV_MASK: u32 = 0xf << GITS_IIDR_REV_SHIFT;

// GITS_TYPER (https://developer.arm.com/documentation/ihi0069/latest)
const GITS_TYPER_PLPIS: u64 = 1 << 0;
const GITS_TYPER_ITT_ENTRY_SIZE_SHIFT: u64 = 4;
const GITS_TYPER_IDBITS_SHIFT: u64 = 8;
const GITS_TYPER_DEVBITS_SHIFT: u64 = 13;
const GITS_TYPER_CIDBITS_SHIFT: u64 = 32;
const GITS_TYPER_CIL: u64 = 1 << 36;

pub const GITS_CBASER_VALID: u64 = 1 << 63;
const GITS_CBASER_ADDRESS_MASK: u64 = genmask(51, 12);
const GITS_CBASER_SIZE_MASK: u64 = 0xff;

pub const GITS_BASER_VALID: u64 = 1 << 63;
pub const GITS_BASER_INDIRECT: u64 = 1 << 62;
const GITS_BASER_INNER_CACHE_SHIFT: u64 = 59;
pub const GITS_BASER_TYPE_SHIFT: u64 = 56;
const GITS_BASER_OUTER_CACHE_SHIFT: u64 = 53;
pub const GITS_BASER_ENTRY_SIZE_SHIFT: u64 = 48;
const GITS_BASER_SHAREABILITY_SHIFT: u64 = 10;
const GITS_BASER_PAGE_SIZE_SHIFT: u64 = 8;
const GITS_BASER_PAGE_SIZE_64K: u64 = 2 << GITS_BASER_PAGE_SIZE_SHIFT;
const GITS_BASER_PAGE_SIZE_MASK: u64 = 3 << GITS_BASER_PAGE_SIZE_SHIFT;
const GITS_BASER_NR_PAGES_MASK: u64 = 0xff;
const GITS_BASER_ADDRESS_MASK: u64 = genmask(47, 16);
/// Type and entry size are fixed by the implementation.
pub const GITS_BASER_RO_MASK: u64 = genmask(52, 48) | genmask(58, 56);

pub const GITS_BASER_TYPE_DEVICE: u64 = 1;
pub const GITS_BASER_TYPE_COLLECTION: u64 = 4;

/* Cacheability and shareability encodings shared by BASER and CBASER */
const GIC_BASER_CACHE_SAME_AS_INNER: u64 = 0;
const GIC_BASER_CACHE_NCNB: u64 = 0;
const GIC_BASER_CACHE_NC: u64 = 1;
const GIC_BASER_CACHE_RAWB: u64 = 3;
const GIC_BASER_INNER_SHAREABLE: u64 = 1;
const GIC_BASER_OUTER_SHAREABLE: u64 = 2;

/// Page granule of the device and collection tables.
pub const SZ_64K: u64 = 0x1_0000;
const SZ_4K: u64 = 0x1000;

/// Offset (bits 19:5) of CWRITER and CREADR into the command queue.
pub const ITS_CMD_OFFSET_MASK: u64 = genmask(19, 5);

/* CoreSight PIDR0 value for a GICv3 ITS */
const GITS_PIDR0_ITS: u32 = 0x92;
const GIC_PIDR2_ARCH_GICV3: u32 = 0x30;

pub const fn genmask(high: u32, low: u32) -> u64 {
    (!0u64 >> (63 - high)) & (!0u64 << low)
}

/// Returns `num` bytes of `data` starting at byte `offset`.
pub fn extract_bytes(data: u64, offset: u64, num: usize) -> u64 {
    let value = data >> ((offset & 7) * 8);
    if num >= 8 {
        value
    } else {
        value & genmask(num as u32 * 8 - 1, 0)
    }
}

/// Merges a 32 or 64 bit write at `offset` into the 64-bit register `reg`.
pub fn update_64bit_reg(reg: u64, offset: u64, len: usize, val: u64) -> u64 {
    let lower = ((offset & 4) * 8) as u32;
    let upper = lower + 8 * len as u32 - 1;
    let mask = genmask(upper, lower);
    let val = if len >= 8 {
        val
    } else {
        val & genmask(len as u32 * 8 - 1, 0)
    };
    (reg & !mask) | ((val << lower) & mask)
}

pub fn iidr(abi_rev: u32) -> u32 {
    ((abi_rev << GITS_IIDR_REV_SHIFT) & GITS_IIDR_REV_MASK)
        | (GITS_IIDR_PRODUCT_ID << GITS_IIDR_PRODUCTID_SHIFT)
        | IMPLEMENTER_ARM
}

pub fn typer(
    device_id_bits: u32,
    event_id_bits: u32,
    collection_id_bits: u32,
    ite_size: u64,
) -> u64 {
    let mut reg = GITS_TYPER_PLPIS;
    reg |= ((ite_size - 1) & 0xf) << GITS_TYPER_ITT_ENTRY_SIZE_SHIFT;
    reg |= u64::from((event_id_bits - 1) & 0x1f) << GITS_TYPER_IDBITS_SHIFT;
    reg |= u64::from((device_id_bits - 1) & 0x1f) << GITS_TYPER_DEVBITS_SHIFT;
    reg |= GITS_TYPER_CIL;
    reg |= u64::from((collection_id_bits - 1) & 0xf) << GITS_TYPER_CIDBITS_SHIFT;
    reg
}

/// Value of the CoreSight identification register at `offset`.
pub fn idreg(offset: u64) -> u32 {
    match offset {
        GITS_PIDR0 => GITS_PIDR0_ITS,
        GITS_PIDR1 => 0xb4,
        GITS_PIDR2 => GIC_PIDR2_ARCH_GICV3 | 0x0b,
        // 64K software visible page
        GITS_PIDR4 => 0x40,
        GITS_CIDR0 => 0x0d,
        GITS_CIDR1 => 0xf0,
        GITS_CIDR2 => 0x05,
        GITS_CIDR3 => 0xb1,
        _ => 0,
    }
}

fn field(reg: u64, shift: u64, mask: u64) -> u64 {
    (reg >> shift) & mask
}

fn set_field(reg: u64, shift: u64, mask: u64, value: u64) -> u64 {
    (reg & !(mask << shift)) | ((value & mask) << shift)
}

fn sanitise_shareability(field: u64) -> u64 {
    match field {
        GIC_BASER_OUTER_SHAREABLE => GIC_BASER_INNER_SHAREABLE,
        _ => field,
    }
}

fn sanitise_inner_cacheability(field: u64) -> u64 {
    match field {
        GIC_BASER_CACHE_NCNB | GIC_BASER_CACHE_NC => GIC_BASER_CACHE_RAWB,
        _ => field,
    }
}

fn sanitise_outer_cacheability(field: u64) -> u64 {
    match field {
        GIC_BASER_CACHE_SAME_AS_INNER | GIC_BASER_CACHE_NC => field,
        _ => GIC_BASER_CACHE_NC,
    }
}

fn sanitise_attributes(reg: u64) -> u64 {
    let mut reg = reg;
    reg = set_field(
        reg,
        GITS_BASER_SHAREABILITY_SHIFT,
        0x3,
        sanitise_shareability(field(reg, GITS_BASER_SHAREABILITY_SHIFT, 0x3)),
    );
    reg = set_field(
        reg,
        GITS_BASER_INNER_CACHE_SHIFT,
        0x7,
        sanitise_inner_cacheability(field(reg, GITS_BASER_INNER_CACHE_SHIFT, 0x7)),
    );
    set_field(
        reg,
        GITS_BASER_OUTER_CACHE_SHIFT,
        0x7,
        sanitise_outer_cacheability(field(reg, GITS_BASER_OUTER_CACHE_SHIFT, 0x7)),
    )
}

pub fn sanitise_cbaser(reg: u64) -> u64 {
    // The queue base is kept 64K aligned.
    sanitise_attributes(reg) & !genmask(15, 12)
}

pub fn sanitise_baser(reg: u64) -> u64 {
    // Only the 64K page size is supported, without 52-bit addresses.
    let reg = sanitise_attributes(reg) & !genmask(15, 12);
    (reg & !GITS_BASER_PAGE_SIZE_MASK) | GITS_BASER_PAGE_SIZE_64K
}

pub fn cbaser_address(cbaser: u64) -> u64 {
    cbaser & GITS_CBASER_ADDRESS_MASK
}

/// Size in bytes of the command queue described by `cbaser`.
pub fn cmd_buffer_size(cbaser: u64) -> u64 {
    ((cbaser & GITS_CBASER_SIZE_MASK) + 1) * SZ_4K
}

/// Decoded view of a GITS_BASER<n> value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Baser(pub u64);

impl Baser {
    pub fn is_valid(&self) -> bool {
        self.0 & GITS_BASER_VALID != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.0 & GITS_BASER_INDIRECT != 0
    }

    pub fn address(&self) -> u64 {
        self.0 & GITS_BASER_ADDRESS_MASK
    }

    pub fn entry_size(&self) -> u64 {
        field(self.0, GITS_BASER_ENTRY_SIZE_SHIFT, 0x1f) + 1
    }

    /// Size in bytes of the (level 1) table.
    pub fn table_size(&self) -> u64 {
        ((self.0 & GITS_BASER_NR_PAGES_MASK) + 1) * SZ_64K
    }
}
