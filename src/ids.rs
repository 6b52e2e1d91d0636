//! External identifiers attached to variants and the identifier bag.
//!
//! A bag is two sorted, deduplicated vectors (short catalog ids and
//! HGVS-qualified ids) plus the distinguished CA/PA id slot. On disk each
//! identifier is a one-byte kind tag followed by its payload; the list is
//! terminated by the bag's own kind tag (CA or PA) and the 4-byte id, so no
//! count is stored.

use crate::bytes::{bit8, set_bit8, ByteReader, ByteWriter};
use crate::{Error, NULL_ID};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdentifierKind {
    Ca = 0,
    DbSnp = 1,
    ClinVarAllele = 2,
    ClinVarVariant = 3,
    MyVariantInfoHg19 = 4,
    MyVariantInfoHg38 = 5,
    ExAc = 6,
    GnomAd = 7,
    ClinVarRcv = 8,
    Cosmic = 10,
    ExternalSource = 15,
    Pa = 255,
}

impl IdentifierKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<IdentifierKind> {
        use IdentifierKind::*;
        Some(match tag {
            0 => Ca,
            1 => DbSnp,
            2 => ClinVarAllele,
            3 => ClinVarVariant,
            4 => MyVariantInfoHg19,
            5 => MyVariantInfoHg38,
            6 => ExAc,
            7 => GnomAd,
            8 => ClinVarRcv,
            10 => Cosmic,
            15 => ExternalSource,
            255 => Pa,
            _ => return None,
        })
    }

    /// Short ids carry a small integer payload; the rest qualify an HGVS
    /// expression.
    pub fn is_short(self) -> bool {
        use IdentifierKind::*;
        !matches!(self, MyVariantInfoHg19 | MyVariantInfoHg38 | ExAc | GnomAd)
    }

    pub fn name(self) -> &'static str {
        use IdentifierKind::*;
        match self {
            Ca => "CA",
            DbSnp => "dbSNP",
            ClinVarAllele => "ClinVarAllele",
            ClinVarVariant => "ClinVarVariant",
            MyVariantInfoHg19 => "MyVariantInfo_hg19",
            MyVariantInfoHg38 => "MyVariantInfo_hg38",
            ExAc => "ExAC",
            GnomAd => "gnomAD",
            ClinVarRcv => "ClinVarRCV",
            Cosmic => "COSMIC",
            ExternalSource => "externalSource",
            Pa => "PA",
        }
    }
}

// ------------------------------------------------------------- short ids

/// An id from an external catalog. Ordering and equality follow the catalog
/// id only; the carried extras (preferred name, RCV list) are overwritten on
/// re-registration rather than producing a second entry.
#[derive(Clone, Debug)]
pub enum ShortId {
    DbSnp { rs: u32 },
    ClinVarAllele { allele_id: u32, preferred_name: String },
    ClinVarVariant { variant_id: u32, rcvs: Vec<u32> },
    Cosmic { id: u32, coding: bool, active: bool },
    ExternalSource { id: u8 },
}

impl ShortId {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            ShortId::DbSnp { .. } => IdentifierKind::DbSnp,
            ShortId::ClinVarAllele { .. } => IdentifierKind::ClinVarAllele,
            ShortId::ClinVarVariant { .. } => IdentifierKind::ClinVarVariant,
            ShortId::Cosmic { .. } => IdentifierKind::Cosmic,
            ShortId::ExternalSource { .. } => IdentifierKind::ExternalSource,
        }
    }

    fn order_key(&self) -> (u8, u32, u8) {
        match self {
            ShortId::DbSnp { rs } => (IdentifierKind::DbSnp.tag(), *rs, 0),
            ShortId::ClinVarAllele { allele_id, .. } => {
                (IdentifierKind::ClinVarAllele.tag(), *allele_id, 0)
            }
            ShortId::ClinVarVariant { variant_id, .. } => {
                (IdentifierKind::ClinVarVariant.tag(), *variant_id, 0)
            }
            ShortId::Cosmic { id, coding, .. } => {
                (IdentifierKind::Cosmic.tag(), *id, *coding as u8)
            }
            ShortId::ExternalSource { id } => {
                (IdentifierKind::ExternalSource.tag(), u32::from(*id), 0)
            }
        }
    }

    pub fn data_len(&self) -> usize {
        match self {
            ShortId::DbSnp { .. } => 4,
            ShortId::ClinVarAllele { preferred_name, .. } => 3 + preferred_name.len() + 1,
            ShortId::ClinVarVariant { rcvs, .. } => 3 + 1 + 3 * rcvs.len().min(255),
            ShortId::Cosmic { .. } => 4,
            ShortId::ExternalSource { .. } => 1,
        }
    }

    pub fn save(&self, w: &mut ByteWriter) {
        match self {
            ShortId::DbSnp { rs } => w.put_uint(u64::from(*rs), 4),
            ShortId::ClinVarAllele { allele_id, preferred_name } => {
                w.put_uint(u64::from(*allele_id), 3);
                for &b in preferred_name.as_bytes() {
                    if b == 0 {
                        break;
                    }
                    w.put(b);
                }
                w.put(0);
            }
            ShortId::ClinVarVariant { variant_id, rcvs } => {
                let count = rcvs.len().min(255);
                w.put_uint(u64::from(*variant_id), 3);
                w.put_uint(count as u64, 1);
                for rcv in &rcvs[..count] {
                    w.put_uint(u64::from(*rcv), 3);
                }
            }
            ShortId::Cosmic { id, coding, active } => {
                let mut v = id << 2;
                if *coding {
                    v |= 2;
                }
                if *active {
                    v |= 1;
                }
                w.put_uint(u64::from(v), 4);
            }
            ShortId::ExternalSource { id } => w.put_uint(u64::from(*id), 1),
        }
    }

    pub fn load(kind: IdentifierKind, r: &mut ByteReader) -> Result<ShortId, Error> {
        Ok(match kind {
            IdentifierKind::DbSnp => ShortId::DbSnp { rs: r.read_uint(4)? as u32 },
            IdentifierKind::ClinVarAllele => {
                let allele_id = r.read_uint(3)? as u32;
                let mut name = Vec::new();
                loop {
                    let b = r.get()?;
                    if b == 0 {
                        break;
                    }
                    name.push(b);
                }
                ShortId::ClinVarAllele {
                    allele_id,
                    preferred_name: String::from_utf8(name)
                        .map_err(|_| Error::BadRecord("preferred name is not utf-8"))?,
                }
            }
            IdentifierKind::ClinVarVariant => {
                let variant_id = r.read_uint(3)? as u32;
                let count = r.read_uint(1)? as usize;
                let mut rcvs = Vec::with_capacity(count);
                for _ in 0..count {
                    rcvs.push(r.read_uint(3)? as u32);
                }
                ShortId::ClinVarVariant { variant_id, rcvs }
            }
            IdentifierKind::Cosmic => {
                let v = r.read_uint(4)? as u32;
                ShortId::Cosmic { id: v >> 2, coding: v & 2 != 0, active: v & 1 != 0 }
            }
            IdentifierKind::ExternalSource => {
                ShortId::ExternalSource { id: r.read_uint(1)? as u8 }
            }
            _ => return Err(Error::BadRecord("not a short identifier kind")),
        })
    }

    /// The (kind, value) pairs this identifier contributes to the short-id
    /// indexes; ClinVar variants also index each of their RCV accessions.
    pub fn index_entries(&self, out: &mut Vec<(IdentifierKind, u32)>) {
        match self {
            ShortId::DbSnp { rs } => out.push((IdentifierKind::DbSnp, *rs)),
            ShortId::ClinVarAllele { allele_id, .. } => {
                out.push((IdentifierKind::ClinVarAllele, *allele_id))
            }
            ShortId::ClinVarVariant { variant_id, rcvs } => {
                out.push((IdentifierKind::ClinVarVariant, *variant_id));
                for rcv in rcvs {
                    out.push((IdentifierKind::ClinVarRcv, *rcv));
                }
            }
            ShortId::Cosmic { id, .. } => out.push((IdentifierKind::Cosmic, *id)),
            // external-source tags are not indexed
            ShortId::ExternalSource { .. } => {}
        }
    }
}

impl PartialEq for ShortId {
    fn eq(&self, other: &ShortId) -> bool {
        self.order_key() == other.order_key()
    }
}
impl Eq for ShortId {}
impl PartialOrd for ShortId {
    fn partial_cmp(&self, other: &ShortId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ShortId {
    fn cmp(&self, other: &ShortId) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

// -------------------------------------------------------------- hgvs ids

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HgvsExpression {
    NoHgvs = 0,
    Deletion = 1,
    DeletionWithLength = 2,
    DeletionWithSequence = 3,
    Duplication = 4,
    DuplicationWithLength = 5,
    DuplicationWithSequence = 6,
    Delins = 7,
}

impl HgvsExpression {
    fn from_bits(v: u8) -> HgvsExpression {
        use HgvsExpression::*;
        match v & 7 {
            0 => NoHgvs,
            1 => Deletion,
            2 => DeletionWithLength,
            3 => DeletionWithSequence,
            4 => Duplication,
            5 => DuplicationWithLength,
            6 => DuplicationWithSequence,
            _ => Delins,
        }
    }
}

/// An id whose catalog describes the variant through an HGVS expression;
/// the stored shape is the expression form plus the distance to the
/// right-aligned position and the right extension of the region.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HgvsId {
    pub kind: IdentifierKind,
    pub expression: HgvsExpression,
    pub shift_to_right_aligned: u16,
    pub right_extend: u16,
}

impl HgvsId {
    pub fn new(kind: IdentifierKind) -> HgvsId {
        HgvsId {
            kind,
            expression: HgvsExpression::NoHgvs,
            shift_to_right_aligned: 0,
            right_extend: 0,
        }
    }

    fn keyless(&self) -> bool {
        matches!(self.kind, IdentifierKind::ExAc | IdentifierKind::GnomAd)
    }

    pub fn data_len(&self) -> usize {
        if self.keyless() {
            return 0;
        }
        if self.shift_to_right_aligned < 4 && self.right_extend < 4 {
            1
        } else if self.shift_to_right_aligned < 8 * 16 && self.right_extend < 16 {
            2
        } else if self.shift_to_right_aligned < 4 * 256 && self.right_extend < 256 {
            3
        } else {
            5
        }
    }

    pub fn save(&self, w: &mut ByteWriter) {
        if self.keyless() {
            return;
        }
        let mut head = (self.expression as u8) << 5;
        if self.shift_to_right_aligned < 4 && self.right_extend < 4 {
            set_bit8(&mut head, 3);
            head += (self.shift_to_right_aligned as u8) << 2;
            head += self.right_extend as u8;
            w.put(head);
        } else if self.shift_to_right_aligned < 8 * 16 && self.right_extend < 16 {
            set_bit8(&mut head, 4);
            head += (self.shift_to_right_aligned >> 4) as u8;
            w.put(head);
            w.put_uint(u64::from(((self.shift_to_right_aligned as u32) << 4) + self.right_extend as u32) & 0xff, 1);
        } else if self.shift_to_right_aligned < 4 * 256 && self.right_extend < 256 {
            set_bit8(&mut head, 5);
            head += (self.shift_to_right_aligned >> 8) as u8;
            w.put(head);
            w.put_uint(u64::from(self.shift_to_right_aligned) & 0xff, 1);
            w.put_uint(u64::from(self.right_extend), 1);
        } else {
            w.put(head);
            w.put_uint(u64::from(self.shift_to_right_aligned), 2);
            w.put_uint(u64::from(self.right_extend), 2);
        }
    }

    pub fn load(kind: IdentifierKind, r: &mut ByteReader) -> Result<HgvsId, Error> {
        let mut id = HgvsId::new(kind);
        if id.keyless() {
            return Ok(id);
        }
        let head = r.get()?;
        id.expression = HgvsExpression::from_bits(head >> 5);
        if bit8(head, 3) {
            id.shift_to_right_aligned = u16::from((head >> 2) & 3);
            id.right_extend = u16::from(head & 3);
        } else if bit8(head, 4) {
            id.shift_to_right_aligned = u16::from(head & 7) << 4;
            let low = r.read_uint(1)? as u16;
            id.shift_to_right_aligned += low >> 4;
            id.right_extend = low & 15;
        } else if bit8(head, 5) {
            id.shift_to_right_aligned = u16::from(head & 3) << 8;
            id.shift_to_right_aligned += r.read_uint(1)? as u16;
            id.right_extend = r.read_uint(1)? as u16;
        } else {
            id.shift_to_right_aligned = r.read_uint(2)? as u16;
            id.right_extend = r.read_uint(2)? as u16;
        }
        Ok(id)
    }
}

// ---------------------------------------------------- sorted-vector sets

fn set_union<T: Ord + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn set_difference<T: Ord + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out
}

fn set_intersection<T: Ord + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn sort_dedup<T: Ord>(v: &mut Vec<T>) {
    v.sort();
    v.dedup();
}

// ----------------------------------------------------------------- bags

/// The identifier set of one variant record. `tag` is CA for genomic and PA
/// for protein records and doubles as the list terminator on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifierBag {
    tag: IdentifierKind,
    pub last_id: u32,
    short_ids: Vec<ShortId>,
    hgvs_ids: Vec<HgvsId>,
}

impl IdentifierBag {
    pub fn new(tag: IdentifierKind) -> IdentifierBag {
        IdentifierBag { tag, last_id: NULL_ID, short_ids: Vec::new(), hgvs_ids: Vec::new() }
    }

    pub fn with_ids(
        tag: IdentifierKind,
        mut short_ids: Vec<ShortId>,
        mut hgvs_ids: Vec<HgvsId>,
    ) -> IdentifierBag {
        sort_dedup(&mut short_ids);
        sort_dedup(&mut hgvs_ids);
        IdentifierBag { tag, last_id: NULL_ID, short_ids, hgvs_ids }
    }

    pub fn tag(&self) -> IdentifierKind {
        self.tag
    }

    pub fn short_ids(&self) -> &[ShortId] {
        &self.short_ids
    }

    pub fn hgvs_ids(&self) -> &[HgvsId] {
        &self.hgvs_ids
    }

    pub fn is_empty(&self) -> bool {
        self.short_ids.is_empty() && self.hgvs_ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_id = NULL_ID;
        self.short_ids.clear();
        self.hgvs_ids.clear();
    }

    pub fn insert(&mut self, id: ShortId) {
        match self.short_ids.binary_search(&id) {
            Ok(found) => self.short_ids[found] = id,
            Err(slot) => self.short_ids.insert(slot, id),
        }
    }

    pub fn insert_hgvs(&mut self, id: HgvsId) {
        match self.hgvs_ids.binary_search(&id) {
            Ok(found) => self.hgvs_ids[found] = id,
            Err(slot) => self.hgvs_ids.insert(slot, id),
        }
    }

    /// Union both ways: afterwards the two bags carry the same identifiers.
    pub fn exchange(&mut self, other: &mut IdentifierBag) {
        self.short_ids = set_union(&self.short_ids, &other.short_ids);
        self.hgvs_ids = set_union(&self.hgvs_ids, &other.hgvs_ids);
        other.short_ids = self.short_ids.clone();
        other.hgvs_ids = self.hgvs_ids.clone();
    }

    /// Adds everything from `other`; the returned bag holds exactly the
    /// identifiers that were new to `self`.
    pub fn add(&mut self, other: &IdentifierBag) -> IdentifierBag {
        let mut added = IdentifierBag::new(self.tag);
        added.short_ids = set_difference(&other.short_ids, &self.short_ids);
        added.hgvs_ids = set_difference(&other.hgvs_ids, &self.hgvs_ids);
        self.short_ids = set_union(&self.short_ids, &added.short_ids);
        self.hgvs_ids = set_union(&self.hgvs_ids, &added.hgvs_ids);
        added
    }

    /// Removes everything in `other`; the returned bag holds what was
    /// actually present and removed.
    pub fn remove(&mut self, other: &IdentifierBag) -> IdentifierBag {
        let mut removed = IdentifierBag::new(self.tag);
        removed.short_ids = set_intersection(&self.short_ids, &other.short_ids);
        removed.hgvs_ids = set_intersection(&self.hgvs_ids, &other.hgvs_ids);
        self.short_ids = set_difference(&self.short_ids, &removed.short_ids);
        self.hgvs_ids = set_difference(&self.hgvs_ids, &removed.hgvs_ids);
        removed
    }

    /// Strips every identifier of one kind, returning the removed set.
    pub fn remove_kind(&mut self, kind: IdentifierKind) -> IdentifierBag {
        let mut removed = IdentifierBag::new(self.tag);
        removed.short_ids = self.short_ids.iter().filter(|i| i.kind() == kind).cloned().collect();
        removed.hgvs_ids = self.hgvs_ids.iter().filter(|i| i.kind == kind).cloned().collect();
        self.short_ids.retain(|i| i.kind() != kind);
        self.hgvs_ids.retain(|i| i.kind != kind);
        removed
    }

    pub fn has_one_of(&self, kinds: &[IdentifierKind]) -> bool {
        self.short_ids.iter().any(|i| kinds.contains(&i.kind()))
            || self.hgvs_ids.iter().any(|i| kinds.contains(&i.kind))
    }

    /// The (kind, value) pairs this bag contributes to the short-id indexes.
    pub fn short_index_entries(&self) -> Vec<(IdentifierKind, u32)> {
        let mut out = Vec::new();
        for id in &self.short_ids {
            id.index_entries(&mut out);
        }
        out
    }

    // ------------------------------------------------------ serialization

    pub fn data_len(&self) -> usize {
        let mut len = self.short_ids.len() + self.hgvs_ids.len();
        for id in &self.short_ids {
            len += id.data_len();
        }
        for id in &self.hgvs_ids {
            len += id.data_len();
        }
        len + 1 + 4
    }

    pub fn save(&self, w: &mut ByteWriter) {
        for id in &self.short_ids {
            w.put(id.kind().tag());
            id.save(w);
        }
        for id in &self.hgvs_ids {
            w.put(id.kind.tag());
            id.save(w);
        }
        w.put(self.tag.tag());
        w.put_uint(u64::from(self.last_id), 4);
    }

    pub fn load(tag: IdentifierKind, r: &mut ByteReader) -> Result<IdentifierBag, Error> {
        let mut bag = IdentifierBag::new(tag);
        loop {
            let kind = IdentifierKind::from_tag(r.get()?)
                .ok_or(Error::BadRecord("unknown identifier kind"))?;
            if kind == tag {
                bag.last_id = r.read_uint(4)? as u32;
                break;
            }
            if kind.is_short() {
                bag.short_ids.push(ShortId::load(kind, r)?);
            } else {
                bag.hgvs_ids.push(HgvsId::load(kind, r)?);
            }
        }
        bag.short_ids.sort();
        bag.hgvs_ids.sort();
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{ByteReader, ByteWriter};

    fn rs(n: u32) -> ShortId {
        ShortId::DbSnp { rs: n }
    }

    fn bag_of(ids: &[u32]) -> IdentifierBag {
        IdentifierBag::with_ids(IdentifierKind::Ca, ids.iter().map(|&n| rs(n)).collect(), vec![])
    }

    fn short_values(bag: &IdentifierBag) -> Vec<u32> {
        bag.short_ids()
            .iter()
            .map(|i| match i {
                ShortId::DbSnp { rs } => *rs,
                _ => panic!("unexpected id kind"),
            })
            .collect()
    }

    #[test]
    fn bag_roundtrip_with_mixed_ids() {
        let mut bag = IdentifierBag::with_ids(
            IdentifierKind::Ca,
            vec![
                rs(42),
                ShortId::ClinVarAllele { allele_id: 15000, preferred_name: "NM_000059.4(BRCA2):c.1310_1313del".into() },
                ShortId::ClinVarVariant { variant_id: 9357, rcvs: vec![12, 55555] },
                ShortId::Cosmic { id: 98765, coding: true, active: false },
                ShortId::ExternalSource { id: 3 },
            ],
            vec![
                HgvsId {
                    kind: IdentifierKind::MyVariantInfoHg38,
                    expression: HgvsExpression::Delins,
                    shift_to_right_aligned: 700,
                    right_extend: 90,
                },
                HgvsId::new(IdentifierKind::GnomAd),
            ],
        );
        bag.last_id = 123456;

        let mut buf = vec![0u8; bag.data_len()];
        bag.save(&mut ByteWriter::new(&mut buf));
        let loaded = IdentifierBag::load(IdentifierKind::Ca, &mut ByteReader::new(&buf)).unwrap();
        assert_eq!(loaded, bag);
        assert_eq!(loaded.last_id, 123456);
    }

    #[test]
    fn hgvs_packing_picks_the_smallest_form() {
        for (shift, extend, expect) in
            &[(3u16, 3u16, 1usize), (100, 15, 2), (1000, 200, 3), (5000, 5000, 5)]
        {
            let id = HgvsId {
                kind: IdentifierKind::MyVariantInfoHg19,
                expression: HgvsExpression::Duplication,
                shift_to_right_aligned: *shift,
                right_extend: *extend,
            };
            assert_eq!(id.data_len(), *expect, "shift={} extend={}", shift, extend);
            let mut buf = vec![0u8; id.data_len()];
            id.save(&mut ByteWriter::new(&mut buf));
            let back = HgvsId::load(IdentifierKind::MyVariantInfoHg19, &mut ByteReader::new(&buf))
                .unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn add_is_idempotent_and_reports_new_ids() {
        let mut a = bag_of(&[42]);
        let empty = bag_of(&[]);
        assert!(a.add(&empty).is_empty());
        let again = a.clone();
        assert!(a.add(&again).is_empty());
        assert_eq!(short_values(&a), vec![42]);

        let b = bag_of(&[42, 99]);
        let added = a.add(&b);
        assert_eq!(short_values(&added), vec![99]);
        assert_eq!(short_values(&a), vec![42, 99]);
    }

    #[test]
    fn remove_reports_the_intersection() {
        let mut a = bag_of(&[1, 2, 3]);
        let b = bag_of(&[2, 3, 4]);
        let removed = a.remove(&b);
        assert_eq!(short_values(&removed), vec![2, 3]);
        assert_eq!(short_values(&a), vec![1]);
    }

    #[test]
    fn exchange_makes_both_bags_the_union() {
        let mut a = bag_of(&[1, 5]);
        let mut b = bag_of(&[5, 9]);
        a.exchange(&mut b);
        assert_eq!(short_values(&a), vec![1, 5, 9]);
        assert_eq!(short_values(&b), vec![1, 5, 9]);
    }

    #[test]
    fn remove_kind_and_has_one_of() {
        let mut bag = IdentifierBag::with_ids(
            IdentifierKind::Ca,
            vec![rs(7), ShortId::Cosmic { id: 9, coding: false, active: true }],
            vec![],
        );
        assert!(bag.has_one_of(&[IdentifierKind::Cosmic]));
        assert!(!bag.has_one_of(&[IdentifierKind::ClinVarRcv]));
        let removed = bag.remove_kind(IdentifierKind::Cosmic);
        assert_eq!(removed.short_ids().len(), 1);
        assert!(!bag.has_one_of(&[IdentifierKind::Cosmic]));
        assert!(bag.has_one_of(&[IdentifierKind::DbSnp]));
    }

    #[test]
    fn clinvar_variant_expands_rcv_index_entries() {
        let bag = IdentifierBag::with_ids(
            IdentifierKind::Ca,
            vec![ShortId::ClinVarVariant { variant_id: 11, rcvs: vec![100, 200] }],
            vec![],
        );
        let entries = bag.short_index_entries();
        assert_eq!(
            entries,
            vec![
                (IdentifierKind::ClinVarVariant, 11),
                (IdentifierKind::ClinVarRcv, 100),
                (IdentifierKind::ClinVarRcv, 200),
            ]
        );
    }

    #[test]
    fn duplicate_catalog_id_overwrites_extras() {
        let mut bag = IdentifierBag::new(IdentifierKind::Ca);
        bag.insert(ShortId::ClinVarAllele { allele_id: 5, preferred_name: "old".into() });
        bag.insert(ShortId::ClinVarAllele { allele_id: 5, preferred_name: "new".into() });
        assert_eq!(bag.short_ids().len(), 1);
        match &bag.short_ids()[0] {
            ShortId::ClinVarAllele { preferred_name, .. } => assert_eq!(preferred_name, "new"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
