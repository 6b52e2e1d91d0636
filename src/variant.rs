//! Variant definitions and their packed record forms.
//!
//! A definition is a sorted, non-overlapping run of simple modifications.
//! The common single-modification cases (SNVs, small indels, repeat-unit
//! edits) collapse to a single byte; everything else takes a 4-byte
//! descriptor word per modification, with inserted sequences bit-packed
//! in-line up to 16 nucleotides / 7 amino acids and spilled to the
//! interning table beyond that. The first modification's position is never
//! stored: it is the record's key.

use crate::alphabet::packed_aa_len;
use crate::bytes::{
    bit32, bit8, field32, field8, set_bit32, set_bit8, set_field32, set_field8, shift_right,
    var_uint_len, ByteReader, ByteWriter,
};
use crate::engine::Record;
use crate::ids::{IdentifierBag, IdentifierKind};
use crate::Error;

/// Sequence ids of interned insertions that could not be resolved.
pub const UNKNOWN_SEQUENCE: u32 = u32::MAX;

/// Inserted nucleotide runs longer than this live in the interning table.
pub const MAX_INLINE_NUCLEOTIDES: u16 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariantCategory {
    /// arbitrary deletion / insertion / indel
    NonShiftable = 0,
    /// insertion of tandem-repeat units
    ShiftableInsertion = 1,
    /// duplication of a tandem-repeat unit
    Duplication = 2,
    /// deletion inside a tandem repeat
    ShiftableDeletion = 3,
}

impl VariantCategory {
    fn from_bits(v: u32) -> VariantCategory {
        match v & 3 {
            0 => VariantCategory::NonShiftable,
            1 => VariantCategory::ShiftableInsertion,
            2 => VariantCategory::Duplication,
            _ => VariantCategory::ShiftableDeletion,
        }
    }

    pub(crate) fn carries_sequence(self) -> bool {
        matches!(self, VariantCategory::NonShiftable | VariantCategory::ShiftableInsertion)
    }
}

/// One edit of the reference. `length_change_or_seq` is the length change
/// for repeat-unit edits and the inserted-sequence length otherwise;
/// `sequence` holds the packed inline bases or an interned sequence id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NucleotideModification {
    pub position: u32,
    pub length_before: u16,
    pub length_change_or_seq: u16,
    pub sequence: u32,
    pub category: VariantCategory,
}

impl NucleotideModification {
    fn order_key(&self) -> (u32, u16, VariantCategory, u16, u32) {
        (self.position, self.length_before, self.category, self.length_change_or_seq, self.sequence)
    }
}

impl PartialOrd for NucleotideModification {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for NucleotideModification {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

fn validate_parameters(
    category: VariantCategory,
    length_before: u16,
    length_change: u16,
    sequence: u32,
    sequence_checked: bool,
) -> Result<(), Error> {
    match category {
        VariantCategory::NonShiftable => {
            if sequence_checked && shift_right(u64::from(sequence), 2 * u32::from(length_change)) != 0 {
                return Err(Error::BadRecord("inserted sequence does not fit its length"));
            }
        }
        VariantCategory::ShiftableInsertion => {
            if length_before == 0 || length_change == 0 {
                return Err(Error::BadRecord("repeat insertion needs a unit and a region"));
            }
            if sequence_checked && shift_right(u64::from(sequence), 2 * u32::from(length_change)) != 0 {
                return Err(Error::BadRecord("inserted sequence does not fit its length"));
            }
        }
        VariantCategory::Duplication => {
            if length_before == 0 || length_change > length_before || sequence != 0 {
                return Err(Error::BadRecord("bad duplication parameters"));
            }
        }
        VariantCategory::ShiftableDeletion => {
            if length_before <= length_change || length_change == 0 || sequence != 0 {
                return Err(Error::BadRecord("bad shiftable-deletion parameters"));
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------ genomic definition

/// Sorted, non-overlapping nucleotide modifications; one haplotype.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GenomicDefinition {
    mods: Vec<NucleotideModification>,
}

impl GenomicDefinition {
    pub fn new(mut mods: Vec<NucleotideModification>) -> Result<GenomicDefinition, Error> {
        if mods.is_empty() {
            return Err(Error::AssertionFailed("a variant needs at least one modification"));
        }
        mods.sort();
        for i in 0..mods.len() {
            let m = &mods[i];
            let inline = m.length_change_or_seq <= MAX_INLINE_NUCLEOTIDES;
            validate_parameters(
                m.category,
                m.length_before,
                m.length_change_or_seq,
                m.sequence,
                m.category.carries_sequence() && inline,
            )?;
            if i > 0 {
                let prev = &mods[i - 1];
                let prev_end = u64::from(prev.position) + u64::from(prev.length_before);
                if m.position <= prev.position || u64::from(m.position) < prev_end {
                    return Err(Error::OverlappingModifications);
                }
            }
        }
        Ok(GenomicDefinition { mods })
    }

    /// An all-zero single modification; the stand-in the index records start
    /// from before their payload is read.
    pub fn placeholder(first_position: u32) -> GenomicDefinition {
        GenomicDefinition {
            mods: vec![NucleotideModification {
                position: first_position,
                length_before: 0,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            }],
        }
    }

    pub fn modifications(&self) -> &[NucleotideModification] {
        &self.mods
    }

    pub fn first_position(&self) -> u32 {
        self.mods[0].position
    }

    /// Sequence ids of interned insertions referenced by this definition.
    pub fn interned_sequence_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.mods.iter().filter_map(|m| {
            if m.category.carries_sequence() && m.length_change_or_seq > MAX_INLINE_NUCLEOTIDES {
                Some(m.sequence)
            } else {
                None
            }
        })
    }

    fn short_form(&self) -> bool {
        if self.mods.len() > 1 {
            return false;
        }
        let m = &self.mods[0];
        match m.category {
            VariantCategory::NonShiftable => match m.length_change_or_seq {
                0 => m.length_before > 0 && m.length_before < 5,
                1 | 2 => m.length_before < 2,
                3 => m.length_before == 0,
                _ => false,
            },
            VariantCategory::ShiftableDeletion => {
                m.length_before == m.length_change_or_seq + 1 && m.length_change_or_seq < 5
            }
            VariantCategory::Duplication => {
                m.length_change_or_seq < 3 && m.length_before < m.length_change_or_seq + 4
            }
            VariantCategory::ShiftableInsertion => {
                m.length_before < 3 && m.length_change_or_seq == 1
            }
        }
    }

    fn inline_sequence_bytes(length_change_or_seq: u16) -> usize {
        (((length_change_or_seq as usize) + 3) / 4).min(4)
    }

    pub fn data_len(&self) -> usize {
        if self.short_form() {
            return 1;
        }
        let mut len = 0;
        for m in &self.mods {
            len += 4; // position
            len += 4; // descriptor
            if m.category.carries_sequence() {
                len += Self::inline_sequence_bytes(m.length_change_or_seq);
            }
        }
        len - 4 // the first position is the key
    }

    pub fn save(&self, w: &mut ByteWriter) {
        if self.short_form() {
            let m = &self.mods[0];
            let mut b: u8 = 0;
            match m.category {
                VariantCategory::NonShiftable => match m.length_change_or_seq {
                    0 => {
                        set_bit8(&mut b, 1);
                        set_bit8(&mut b, 2);
                        set_bit8(&mut b, 4);
                        set_field8(&mut b, 6, 2, u32::from(m.length_before) - 1);
                    }
                    1 => {
                        set_bit8(&mut b, 1);
                        set_bit8(&mut b, 2);
                        set_field8(&mut b, 5, 1, u32::from(m.length_before));
                        set_field8(&mut b, 6, 2, m.sequence);
                    }
                    2 => {
                        set_bit8(&mut b, 1);
                        set_field8(&mut b, 3, 1, u32::from(m.length_before));
                        set_field8(&mut b, 4, 4, m.sequence);
                    }
                    _ => {
                        // three inserted bases, nothing deleted
                        set_field8(&mut b, 2, 6, m.sequence);
                    }
                },
                VariantCategory::ShiftableDeletion => {
                    set_bit8(&mut b, 1);
                    set_bit8(&mut b, 2);
                    set_bit8(&mut b, 4);
                    set_bit8(&mut b, 5);
                    set_field8(&mut b, 6, 2, u32::from(m.length_change_or_seq) - 1);
                }
                VariantCategory::Duplication => {
                    set_bit8(&mut b, 1);
                    set_bit8(&mut b, 2);
                    set_bit8(&mut b, 3);
                    set_field8(&mut b, 5, 1, u32::from(m.length_change_or_seq) - 1);
                    set_field8(&mut b, 6, 2, u32::from(m.length_before - m.length_change_or_seq));
                }
                VariantCategory::ShiftableInsertion => {
                    set_bit8(&mut b, 1);
                    set_bit8(&mut b, 2);
                    set_bit8(&mut b, 3);
                    set_bit8(&mut b, 4);
                    set_field8(&mut b, 5, 1, u32::from(m.length_before) - 1);
                    set_field8(&mut b, 6, 2, m.sequence);
                }
            }
            w.put(b);
            return;
        }

        let last = self.mods.len() - 1;
        for (i, m) in self.mods.iter().enumerate() {
            if i > 0 {
                w.put_uint(u64::from(m.position), 4);
            }
            let mut def: u32 = 0;
            set_bit32(&mut def, 0);
            if i != last {
                set_bit32(&mut def, 1);
            }
            set_field32(&mut def, 2, 2, m.category as u32);
            if m.category == VariantCategory::ShiftableDeletion {
                set_field32(&mut def, 4, 14, u32::from(m.length_before - m.length_change_or_seq));
            } else {
                set_field32(&mut def, 4, 14, u32::from(m.length_before));
            }
            set_field32(&mut def, 18, 14, u32::from(m.length_change_or_seq));
            w.put_uint(u64::from(def), 4);
            if m.category.carries_sequence() {
                w.put_uint(
                    u64::from(m.sequence),
                    Self::inline_sequence_bytes(m.length_change_or_seq),
                );
            }
        }
    }

    pub fn load(first_position: u32, r: &mut ByteReader) -> Result<GenomicDefinition, Error> {
        // short forms have a clear top bit
        if !bit8(r.peek()?, 0) {
            let b = r.get()?;
            let mut m = NucleotideModification {
                position: first_position,
                length_before: 0,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            };
            if !bit8(b, 1) {
                m.length_change_or_seq = 3;
                m.sequence = field8(b, 2, 6);
            } else if !bit8(b, 2) {
                m.length_before = field8(b, 3, 1) as u16;
                m.length_change_or_seq = 2;
                m.sequence = field8(b, 4, 4);
            } else if !bit8(b, 3) {
                if !bit8(b, 4) {
                    m.length_before = field8(b, 5, 1) as u16;
                    m.length_change_or_seq = 1;
                    m.sequence = field8(b, 6, 2);
                } else if !bit8(b, 5) {
                    m.length_before = field8(b, 6, 2) as u16 + 1;
                } else {
                    m.category = VariantCategory::ShiftableDeletion;
                    m.length_change_or_seq = field8(b, 6, 2) as u16 + 1;
                    m.length_before = m.length_change_or_seq + 1;
                }
            } else if !bit8(b, 4) {
                m.category = VariantCategory::Duplication;
                m.length_change_or_seq = field8(b, 5, 1) as u16 + 1;
                m.length_before = field8(b, 6, 2) as u16 + m.length_change_or_seq;
            } else {
                m.category = VariantCategory::ShiftableInsertion;
                m.length_before = field8(b, 5, 1) as u16 + 1;
                m.length_change_or_seq = 1;
                m.sequence = field8(b, 6, 2);
            }
            return Ok(GenomicDefinition { mods: vec![m] });
        }

        let mut mods: Vec<NucleotideModification> = Vec::new();
        loop {
            let position =
                if mods.is_empty() { first_position } else { r.read_uint(4)? as u32 };
            let def = r.read_uint(4)? as u32;
            let has_next = bit32(def, 1);
            let category = VariantCategory::from_bits(field32(def, 2, 2));
            let mut length_before = field32(def, 4, 14) as u16;
            let length_change_or_seq = field32(def, 18, 14) as u16;
            if category == VariantCategory::ShiftableDeletion {
                length_before += length_change_or_seq;
            }
            let sequence = if category.carries_sequence() {
                r.read_uint(Self::inline_sequence_bytes(length_change_or_seq))? as u32
            } else {
                0
            };
            mods.push(NucleotideModification {
                position,
                length_before,
                length_change_or_seq,
                sequence,
                category,
            });
            if !has_next {
                break;
            }
        }
        Ok(GenomicDefinition { mods })
    }
}

// ------------------------------------------------------ protein definition

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AminoAcidModification {
    pub position: u16,
    pub length_before: u16,
    pub length_change_or_seq: u16,
    pub sequence: u32,
    pub category: VariantCategory,
}

impl AminoAcidModification {
    fn order_key(&self) -> (u16, u16, VariantCategory, u16, u32) {
        (self.position, self.length_before, self.category, self.length_change_or_seq, self.sequence)
    }
}

impl PartialOrd for AminoAcidModification {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for AminoAcidModification {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Modifications of one protein sequence, addressed by the 24-bit protein
/// accession id; the record key packs `(accession << 16) | first position`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProteinDefinition {
    protein_id: u64,
    mods: Vec<AminoAcidModification>,
}

impl ProteinDefinition {
    pub fn new(
        protein_id: u64,
        mut mods: Vec<AminoAcidModification>,
    ) -> Result<ProteinDefinition, Error> {
        if mods.is_empty() {
            return Err(Error::AssertionFailed("a variant needs at least one modification"));
        }
        if protein_id >> 24 != 0 {
            return Err(Error::BadRecord("protein accession id exceeds 24 bits"));
        }
        if mods.iter().any(|m| m.category.carries_sequence() && m.length_change_or_seq > 7) {
            return Err(Error::SequenceTooLong);
        }
        mods.sort();
        for i in 0..mods.len() {
            let m = &mods[i];
            validate_parameters(
                m.category,
                m.length_before,
                m.length_change_or_seq,
                m.sequence,
                false,
            )?;
            if i > 0 {
                let prev = &mods[i - 1];
                let prev_end = u64::from(prev.position) + u64::from(prev.length_before);
                if m.position <= prev.position || u64::from(m.position) < prev_end {
                    return Err(Error::OverlappingModifications);
                }
            }
        }
        Ok(ProteinDefinition { protein_id, mods })
    }

    pub fn placeholder(key: u64) -> ProteinDefinition {
        ProteinDefinition {
            protein_id: key >> 16,
            mods: vec![AminoAcidModification {
                position: (key & 0xffff) as u16,
                length_before: 0,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            }],
        }
    }

    pub fn modifications(&self) -> &[AminoAcidModification] {
        &self.mods
    }

    pub fn protein_id(&self) -> u64 {
        self.protein_id
    }

    pub fn first_position(&self) -> u16 {
        self.mods[0].position
    }

    pub fn key(&self) -> u64 {
        (self.protein_id << 16) | u64::from(self.first_position())
    }

    fn short_form(&self) -> bool {
        if self.mods.len() > 1 {
            return false;
        }
        let m = &self.mods[0];
        match m.category {
            VariantCategory::NonShiftable => match m.length_change_or_seq {
                0 => m.length_before <= 8,
                1 => m.length_before <= 2,
                _ => false,
            },
            VariantCategory::ShiftableDeletion => {
                m.length_before == m.length_change_or_seq + 1 && m.length_change_or_seq <= 8
            }
            VariantCategory::Duplication => {
                m.length_change_or_seq <= 4 && m.length_before < m.length_change_or_seq + 4
            }
            VariantCategory::ShiftableInsertion => false,
        }
    }

    fn inline_sequence_bytes(length_change_or_seq: u16) -> usize {
        packed_aa_len(length_change_or_seq as usize).min(4)
    }

    pub fn data_len(&self) -> usize {
        if self.short_form() {
            return 1;
        }
        let mut len = 0;
        for m in &self.mods {
            len += 2; // position
            len += 4; // descriptor
            if m.category.carries_sequence() {
                len += Self::inline_sequence_bytes(m.length_change_or_seq);
            }
        }
        len - 2
    }

    pub fn save(&self, w: &mut ByteWriter) {
        if self.short_form() {
            let m = &self.mods[0];
            let mut b: u8 = 0;
            match m.category {
                VariantCategory::NonShiftable => {
                    if m.length_change_or_seq == 1 {
                        match m.length_before {
                            1 => set_bit8(&mut b, 2),
                            2 => set_bit8(&mut b, 1),
                            _ => {}
                        }
                        set_field8(&mut b, 3, 5, m.sequence);
                    } else {
                        set_bit8(&mut b, 1);
                        set_bit8(&mut b, 2);
                        set_field8(&mut b, 5, 3, u32::from(m.length_before) - 1);
                    }
                }
                VariantCategory::ShiftableDeletion => {
                    set_bit8(&mut b, 1);
                    set_bit8(&mut b, 2);
                    set_bit8(&mut b, 4);
                    set_field8(&mut b, 5, 3, u32::from(m.length_change_or_seq) - 1);
                }
                VariantCategory::Duplication => {
                    set_bit8(&mut b, 1);
                    set_bit8(&mut b, 2);
                    set_bit8(&mut b, 3);
                    set_field8(&mut b, 4, 2, u32::from(m.length_change_or_seq) - 1);
                    set_field8(&mut b, 6, 2, u32::from(m.length_before - m.length_change_or_seq));
                }
                VariantCategory::ShiftableInsertion => unreachable!("never a short form"),
            }
            w.put(b);
            return;
        }

        let last = self.mods.len() - 1;
        for (i, m) in self.mods.iter().enumerate() {
            if i > 0 {
                w.put_uint(u64::from(m.position), 2);
            }
            let mut def: u32 = 0;
            set_bit32(&mut def, 0);
            if i != last {
                set_bit32(&mut def, 1);
            }
            set_field32(&mut def, 6, 2, m.category as u32);
            if m.category == VariantCategory::ShiftableDeletion {
                set_field32(&mut def, 8, 12, u32::from(m.length_before - m.length_change_or_seq));
            } else {
                set_field32(&mut def, 8, 12, u32::from(m.length_before));
            }
            set_field32(&mut def, 20, 12, u32::from(m.length_change_or_seq));
            w.put_uint(u64::from(def), 4);
            if m.category.carries_sequence() {
                w.put_uint(
                    u64::from(m.sequence),
                    Self::inline_sequence_bytes(m.length_change_or_seq),
                );
            }
        }
    }

    pub fn load(key: u64, r: &mut ByteReader) -> Result<ProteinDefinition, Error> {
        let protein_id = key >> 16;
        let first_position = (key & 0xffff) as u16;
        if !bit8(r.peek()?, 0) {
            let b = r.get()?;
            let mut m = AminoAcidModification {
                position: first_position,
                length_before: 0,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            };
            if !bit8(b, 1) {
                m.length_before = field8(b, 2, 1) as u16;
                m.length_change_or_seq = 1;
                m.sequence = field8(b, 3, 5);
            } else if !bit8(b, 2) {
                m.length_before = 2;
                m.length_change_or_seq = 1;
                m.sequence = field8(b, 3, 5);
            } else if !bit8(b, 3) {
                if !bit8(b, 4) {
                    m.length_before = field8(b, 5, 3) as u16 + 1;
                } else {
                    m.category = VariantCategory::ShiftableDeletion;
                    m.length_change_or_seq = field8(b, 5, 3) as u16 + 1;
                    m.length_before = m.length_change_or_seq + 1;
                }
            } else {
                m.category = VariantCategory::Duplication;
                m.length_change_or_seq = field8(b, 4, 2) as u16 + 1;
                m.length_before = field8(b, 6, 2) as u16 + m.length_change_or_seq;
            }
            return Ok(ProteinDefinition { protein_id, mods: vec![m] });
        }

        let mut mods: Vec<AminoAcidModification> = Vec::new();
        loop {
            let position =
                if mods.is_empty() { first_position } else { r.read_uint(2)? as u16 };
            let def = r.read_uint(4)? as u32;
            let has_next = bit32(def, 1);
            let category = VariantCategory::from_bits(field32(def, 6, 2));
            let mut length_before = field32(def, 8, 12) as u16;
            let length_change_or_seq = field32(def, 20, 12) as u16;
            if category == VariantCategory::ShiftableDeletion {
                length_before += length_change_or_seq;
            }
            let sequence = if category.carries_sequence() {
                r.read_uint(Self::inline_sequence_bytes(length_change_or_seq))? as u32
            } else {
                0
            };
            mods.push(AminoAcidModification {
                position,
                length_before,
                length_change_or_seq,
                sequence,
                category,
            });
            if !has_next {
                break;
            }
        }
        Ok(ProteinDefinition { protein_id, mods })
    }
}

// ------------------------------------------------------------- records

/// A definition seen somewhere in the registry, tagged by alphabet; what the
/// identifier indexes point at.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariantSeen {
    Genomic(GenomicDefinition),
    Protein(ProteinDefinition),
}

impl VariantSeen {
    pub fn is_genomic(&self) -> bool {
        matches!(self, VariantSeen::Genomic(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenomicVariantRecord {
    pub definition: GenomicDefinition,
    pub revision: u32,
    pub identifiers: IdentifierBag,
}

impl GenomicVariantRecord {
    pub fn new(definition: GenomicDefinition) -> GenomicVariantRecord {
        GenomicVariantRecord {
            definition,
            revision: 0,
            identifiers: IdentifierBag::new(IdentifierKind::Ca),
        }
    }
}

impl Record for GenomicVariantRecord {
    const KEY_BYTES: usize = 4;

    fn key(&self) -> u64 {
        u64::from(self.definition.first_position())
    }

    fn data_len(&self) -> usize {
        self.definition.data_len()
            + var_uint_len(u64::from(self.revision), 2, 1)
            + self.identifiers.data_len()
    }

    fn save(&self, out: &mut ByteWriter) {
        self.definition.save(out);
        out.put_var_uint(u64::from(self.revision), 2, 1);
        self.identifiers.save(out);
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<GenomicVariantRecord, Error> {
        let definition = GenomicDefinition::load(key as u32, input)?;
        let revision = input.read_var_uint(2, 1)? as u32;
        let identifiers = IdentifierBag::load(IdentifierKind::Ca, input)?;
        Ok(GenomicVariantRecord { definition, revision, identifiers })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProteinVariantRecord {
    pub definition: ProteinDefinition,
    pub revision: u32,
    pub identifiers: IdentifierBag,
}

impl ProteinVariantRecord {
    pub fn new(definition: ProteinDefinition) -> ProteinVariantRecord {
        ProteinVariantRecord {
            definition,
            revision: 0,
            identifiers: IdentifierBag::new(IdentifierKind::Pa),
        }
    }
}

impl Record for ProteinVariantRecord {
    const KEY_BYTES: usize = 5;

    fn key(&self) -> u64 {
        self.definition.key()
    }

    fn data_len(&self) -> usize {
        self.definition.data_len()
            + var_uint_len(u64::from(self.revision), 2, 1)
            + self.identifiers.data_len()
    }

    fn save(&self, out: &mut ByteWriter) {
        self.definition.save(out);
        out.put_var_uint(u64::from(self.revision), 2, 1);
        self.identifiers.save(out);
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<ProteinVariantRecord, Error> {
        let definition = ProteinDefinition::load(key, input)?;
        let revision = input.read_var_uint(2, 1)? as u32;
        let identifiers = IdentifierBag::load(IdentifierKind::Pa, input)?;
        Ok(ProteinVariantRecord { definition, revision, identifiers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::nucleotides_to_bits;
    use crate::ids::ShortId;

    fn single(
        category: VariantCategory,
        position: u32,
        length_before: u16,
        length_change_or_seq: u16,
        sequence: u32,
    ) -> GenomicDefinition {
        GenomicDefinition::new(vec![NucleotideModification {
            position,
            length_before,
            length_change_or_seq,
            sequence,
            category,
        }])
        .unwrap()
    }

    fn roundtrip_genomic(def: &GenomicDefinition) -> GenomicDefinition {
        let mut buf = vec![0u8; def.data_len()];
        let mut w = ByteWriter::new(&mut buf);
        def.save(&mut w);
        assert_eq!(w.tell(), def.data_len());
        let mut r = ByteReader::new(&buf);
        let back = GenomicDefinition::load(def.first_position(), &mut r).unwrap();
        assert!(r.eof());
        back
    }

    #[test]
    fn snv_is_one_byte() {
        // A>C at one position: substitution of length 1 with one new base
        let def = single(
            VariantCategory::NonShiftable,
            1_000_000,
            1,
            1,
            nucleotides_to_bits("C").unwrap(),
        );
        assert_eq!(def.data_len(), 1);
        assert_eq!(roundtrip_genomic(&def), def);
    }

    #[test]
    fn genomic_short_form_templates() {
        let cases: Vec<GenomicDefinition> = vec![
            // pure deletions of 1..4 bases
            single(VariantCategory::NonShiftable, 10, 1, 0, 0),
            single(VariantCategory::NonShiftable, 10, 4, 0, 0),
            // 1-base change, insert flavor
            single(VariantCategory::NonShiftable, 10, 0, 1, 2),
            // 2-base with and without a deleted base
            single(VariantCategory::NonShiftable, 10, 0, 2, 9),
            single(VariantCategory::NonShiftable, 10, 1, 2, 15),
            // 3-base pure insertion
            single(VariantCategory::NonShiftable, 10, 0, 3, 0b101010),
            // shiftable deletions of 1..4
            single(VariantCategory::ShiftableDeletion, 10, 2, 1, 0),
            single(VariantCategory::ShiftableDeletion, 10, 5, 4, 0),
            // duplications
            single(VariantCategory::Duplication, 10, 1, 1, 0),
            single(VariantCategory::Duplication, 10, 4, 2, 0),
            // shiftable insertions of one base
            single(VariantCategory::ShiftableInsertion, 10, 1, 1, 3),
            single(VariantCategory::ShiftableInsertion, 10, 2, 1, 0),
        ];
        for def in cases {
            assert_eq!(def.data_len(), 1, "{:?}", def);
            assert_eq!(roundtrip_genomic(&def), def);
        }
    }

    #[test]
    fn genomic_long_forms() {
        let cases: Vec<GenomicDefinition> = vec![
            // too long for the short templates
            single(VariantCategory::NonShiftable, 500, 5, 0, 0),
            single(VariantCategory::NonShiftable, 500, 2, 2, 9),
            single(
                VariantCategory::NonShiftable,
                500,
                10,
                16,
                nucleotides_to_bits("ACGTACGTACGTACGT").unwrap(),
            ),
            single(VariantCategory::ShiftableDeletion, 500, 100, 40, 0),
            single(VariantCategory::Duplication, 500, 30, 10, 0),
            single(VariantCategory::ShiftableInsertion, 500, 6, 3, 0b111111),
        ];
        for def in cases {
            assert!(def.data_len() > 1);
            assert_eq!(roundtrip_genomic(&def), def);
        }
    }

    #[test]
    fn multi_modification_roundtrip() {
        let def = GenomicDefinition::new(vec![
            NucleotideModification {
                position: 2000,
                length_before: 1,
                length_change_or_seq: 1,
                sequence: 3,
                category: VariantCategory::NonShiftable,
            },
            NucleotideModification {
                position: 1000,
                length_before: 10,
                length_change_or_seq: 4,
                sequence: 0,
                category: VariantCategory::ShiftableDeletion,
            },
        ])
        .unwrap();
        // sorted on construction
        assert_eq!(def.first_position(), 1000);
        assert_eq!(def.data_len(), (4 + 4) + (4 + 4 + 1) - 4);
        assert_eq!(roundtrip_genomic(&def), def);
    }

    #[test]
    fn interned_sequence_id_survives() {
        let def = single(VariantCategory::NonShiftable, 100, 0, 500, 0xdeadbeef);
        assert_eq!(def.interned_sequence_ids().collect::<Vec<u32>>(), vec![0xdeadbeef]);
        assert_eq!(roundtrip_genomic(&def), def);
    }

    #[test]
    fn overlapping_modifications_are_rejected() {
        let overlapping = GenomicDefinition::new(vec![
            NucleotideModification {
                position: 100,
                length_before: 10,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            },
            NucleotideModification {
                position: 105,
                length_before: 1,
                length_change_or_seq: 1,
                sequence: 1,
                category: VariantCategory::NonShiftable,
            },
        ]);
        assert!(matches!(overlapping, Err(Error::OverlappingModifications)));

        let same_position = GenomicDefinition::new(vec![
            NucleotideModification {
                position: 100,
                length_before: 0,
                length_change_or_seq: 1,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            },
            NucleotideModification {
                position: 100,
                length_before: 1,
                length_change_or_seq: 0,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            },
        ]);
        assert!(same_position.is_err());
    }

    #[test]
    fn bad_parameters_are_rejected() {
        assert!(GenomicDefinition::new(vec![NucleotideModification {
            position: 1,
            length_before: 5,
            length_change_or_seq: 10, // unit longer than the region
            sequence: 0,
            category: VariantCategory::Duplication,
        }])
        .is_err());
        assert!(GenomicDefinition::new(vec![NucleotideModification {
            position: 1,
            length_before: 3,
            length_change_or_seq: 3, // would delete the whole region
            sequence: 0,
            category: VariantCategory::ShiftableDeletion,
        }])
        .is_err());
        assert!(GenomicDefinition::new(vec![NucleotideModification {
            position: 1,
            length_before: 0,
            length_change_or_seq: 1,
            sequence: 9, // two bases encoded for a one-base insertion
            category: VariantCategory::NonShiftable,
        }])
        .is_err());
    }

    fn protein_single(
        category: VariantCategory,
        position: u16,
        length_before: u16,
        length_change_or_seq: u16,
        sequence: u32,
    ) -> ProteinDefinition {
        ProteinDefinition::new(
            77,
            vec![AminoAcidModification {
                position,
                length_before,
                length_change_or_seq,
                sequence,
                category,
            }],
        )
        .unwrap()
    }

    fn roundtrip_protein(def: &ProteinDefinition) -> ProteinDefinition {
        let mut buf = vec![0u8; def.data_len()];
        let mut w = ByteWriter::new(&mut buf);
        def.save(&mut w);
        assert_eq!(w.tell(), def.data_len());
        let mut r = ByteReader::new(&buf);
        let back = ProteinDefinition::load(def.key(), &mut r).unwrap();
        assert!(r.eof());
        back
    }

    #[test]
    fn protein_key_packs_accession_and_position() {
        let def = protein_single(VariantCategory::NonShiftable, 0x0123, 1, 1, 7);
        assert_eq!(def.key(), (77 << 16) | 0x0123);
        assert_eq!(def.protein_id(), 77);
    }

    #[test]
    fn protein_short_forms() {
        let cases: Vec<ProteinDefinition> = vec![
            // single-residue substitutions with 0..2 deleted
            protein_single(VariantCategory::NonShiftable, 9, 0, 1, 22),
            protein_single(VariantCategory::NonShiftable, 9, 1, 1, 13),
            protein_single(VariantCategory::NonShiftable, 9, 2, 1, 0),
            // 1..8 residue deletions
            protein_single(VariantCategory::NonShiftable, 9, 1, 0, 0),
            protein_single(VariantCategory::NonShiftable, 9, 8, 0, 0),
            // shiftable deletions
            protein_single(VariantCategory::ShiftableDeletion, 9, 2, 1, 0),
            protein_single(VariantCategory::ShiftableDeletion, 9, 9, 8, 0),
            // duplications
            protein_single(VariantCategory::Duplication, 9, 4, 4, 0),
            protein_single(VariantCategory::Duplication, 9, 6, 3, 0),
        ];
        for def in cases {
            assert_eq!(def.data_len(), 1, "{:?}", def);
            assert_eq!(roundtrip_protein(&def), def);
        }
    }

    #[test]
    fn protein_long_forms() {
        let cases: Vec<ProteinDefinition> = vec![
            protein_single(VariantCategory::NonShiftable, 40, 9, 0, 0),
            protein_single(VariantCategory::NonShiftable, 40, 1, 7, 3_000_000_000),
            protein_single(VariantCategory::ShiftableInsertion, 40, 2, 2, 500),
            protein_single(VariantCategory::Duplication, 40, 100, 10, 0),
        ];
        for def in cases {
            assert!(def.data_len() > 1);
            assert_eq!(roundtrip_protein(&def), def);
        }
    }

    #[test]
    fn protein_insertions_over_seven_residues_are_rejected() {
        let result = ProteinDefinition::new(
            5,
            vec![AminoAcidModification {
                position: 1,
                length_before: 0,
                length_change_or_seq: 8,
                sequence: 0,
                category: VariantCategory::NonShiftable,
            }],
        );
        assert!(matches!(result, Err(Error::SequenceTooLong)));
    }

    #[test]
    fn record_layout_matches_declared_length() {
        let mut record = GenomicVariantRecord::new(single(
            VariantCategory::NonShiftable,
            1_000_000,
            1,
            1,
            1,
        ));
        record.revision = 3;
        record.identifiers.insert(ShortId::DbSnp { rs: 42 });
        record.identifiers.last_id = 77;

        // short definition (1) + revision var-int (2) + bag (1+4 for the
        // dbSNP id, 1+4 terminator)
        assert_eq!(record.data_len(), 1 + 2 + (1 + 4) + (1 + 4));

        let mut buf = vec![0u8; record.data_len()];
        let mut w = ByteWriter::new(&mut buf);
        record.save(&mut w);
        assert_eq!(w.tell(), record.data_len());
        let back = GenomicVariantRecord::load(record.key(), &mut ByteReader::new(&buf)).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn protein_record_roundtrip() {
        let mut record = ProteinVariantRecord::new(protein_single(
            VariantCategory::NonShiftable,
            12,
            1,
            1,
            20,
        ));
        record.revision = 1;
        record.identifiers.last_id = 9001;
        let mut buf = vec![0u8; record.data_len()];
        let mut w = ByteWriter::new(&mut buf);
        record.save(&mut w);
        assert_eq!(w.tell(), record.data_len());
        let back = ProteinVariantRecord::load(record.key(), &mut ByteReader::new(&buf)).unwrap();
        assert_eq!(back, record);
    }
}
