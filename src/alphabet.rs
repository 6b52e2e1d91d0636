//! Nucleotide and amino-acid alphabets and their packed integer forms.
//!
//! Nucleotides pack 2 bits per base, most significant base first, so a run
//! of up to 16 bases fits a u32. Amino acids pack base-23 (22 codes plus the
//! stop `*`), five residues per u32 word at most; the codec layer caps a
//! single packed insertion at 7 residues.

use crate::Error;
use once_cell::sync::Lazy;

pub const MAX_PACKED_NUCLEOTIDES: usize = 16;
pub const MAX_PACKED_AMINO_ACIDS: usize = 7;

static AMINO_ACIDS: &[u8; 23] = b"ACDEFGHIKLMNOPQRSTUVWY*";

static AA_CODES: Lazy<[i8; 256]> = Lazy::new(|| {
    let mut table = [-1i8; 256];
    for (i, aa) in AMINO_ACIDS.iter().enumerate() {
        table[*aa as usize] = i as i8;
    }
    table
});

pub fn nucleotides_to_bits(seq: &str) -> Result<u32, Error> {
    if seq.len() > MAX_PACKED_NUCLEOTIDES {
        return Err(Error::SequenceTooLong);
    }
    let mut value: u32 = 0;
    for c in seq.bytes() {
        value <<= 2;
        value += match c {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => return Err(Error::BadRecord("not a nucleotide")),
        };
    }
    Ok(value)
}

pub fn bits_to_nucleotides(mut value: u32, length: usize) -> Result<String, Error> {
    if length > MAX_PACKED_NUCLEOTIDES {
        return Err(Error::SequenceTooLong);
    }
    let mut seq = vec![b'A'; length];
    for slot in seq.iter_mut().rev() {
        *slot = match value % 4 {
            0 => b'A',
            1 => b'C',
            2 => b'G',
            _ => b'T',
        };
        value >>= 2;
    }
    Ok(String::from_utf8(seq).unwrap())
}

/// Bytes needed for a base-23 packed amino-acid run of the given length.
pub fn packed_aa_len(length_in_aa: usize) -> usize {
    let mut r = (length_in_aa / 7) * 4;
    r += match length_in_aa % 7 {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        4 | 5 => 3,
        _ => 4,
    };
    r
}

pub fn amino_acids_to_bits(seq: &str) -> Result<u32, Error> {
    if seq.len() > MAX_PACKED_AMINO_ACIDS {
        return Err(Error::SequenceTooLong);
    }
    let mut value: u32 = 0;
    for c in seq.bytes() {
        let code = AA_CODES[c as usize];
        if code < 0 {
            return Err(Error::BadRecord("not an amino-acid code"));
        }
        value = value * 23 + code as u32;
    }
    Ok(value)
}

pub fn bits_to_amino_acids(mut value: u32, length: usize) -> Result<String, Error> {
    if length > MAX_PACKED_AMINO_ACIDS {
        return Err(Error::SequenceTooLong);
    }
    let mut seq = vec![b'A'; length];
    for slot in seq.iter_mut().rev() {
        *slot = AMINO_ACIDS[(value % 23) as usize];
        value /= 23;
    }
    Ok(String::from_utf8(seq).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nucleotide_roundtrip() {
        for seq in &["", "A", "ACGT", "TTTTTTTTTTTTTTTT", "GATTACA"] {
            let bits = nucleotides_to_bits(seq).unwrap();
            assert_eq!(&bits_to_nucleotides(bits, seq.len()).unwrap(), seq);
        }
        assert_eq!(nucleotides_to_bits("ACGT").unwrap(), 0b00_01_10_11);
        assert!(nucleotides_to_bits("ACGTN").is_err());
        assert!(nucleotides_to_bits("AAAAAAAAAAAAAAAAA").is_err());
    }

    #[test]
    fn amino_acid_roundtrip() {
        for seq in &["", "M", "MKV*", "WYWYWYW"] {
            let bits = amino_acids_to_bits(seq).unwrap();
            assert_eq!(&bits_to_amino_acids(bits, seq.len()).unwrap(), seq);
        }
        assert!(amino_acids_to_bits("MKVLWAAL").is_err()); // 8 aa
        assert!(amino_acids_to_bits("MX").is_err());
    }

    #[test]
    fn packed_aa_lengths() {
        assert_eq!(packed_aa_len(0), 0);
        assert_eq!(packed_aa_len(1), 1);
        assert_eq!(packed_aa_len(2), 2);
        assert_eq!(packed_aa_len(3), 2);
        assert_eq!(packed_aa_len(4), 3);
        assert_eq!(packed_aa_len(5), 3);
        assert_eq!(packed_aa_len(6), 4);
        assert_eq!(packed_aa_len(7), 4);
        assert_eq!(packed_aa_len(14), 8);
    }
}
