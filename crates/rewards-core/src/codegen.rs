use rand::Rng;

/// Uppercase alphanumerics without the look-alikes 0/O and 1/I.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_GROUPS: usize = 3;
pub const CODE_GROUP_LEN: usize = 4;
pub const CODE_DELIMITER: char = '-';

/// Source of human-presentable redemption codes.
///
/// Implementations only promise low collision probability; the store's unique index
/// on codes is what guarantees uniqueness.
pub trait RedemptionCodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Thread-local CSPRNG backed generator producing `XXXX-XXXX-XXXX`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl RedemptionCodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(CODE_GROUPS * (CODE_GROUP_LEN + 1));
        for group in 0..CODE_GROUPS {
            if group > 0 {
                code.push(CODE_DELIMITER);
            }
            for _ in 0..CODE_GROUP_LEN {
                let idx = rng.gen_range(0..CODE_ALPHABET.len());
                code.push(CODE_ALPHABET[idx] as char);
            }
        }
        code
    }
}

/// True when `code` has the generator's shape.
pub fn is_well_formed(code: &str) -> bool {
    let groups: Vec<&str> = code.split(CODE_DELIMITER).collect();
    groups.len() == CODE_GROUPS
        && groups.iter().all(|group| {
            group.len() == CODE_GROUP_LEN && group.bytes().all(|b| CODE_ALPHABET.contains(&b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn generated_codes_are_well_formed() {
        let generator = RandomCodeGenerator;
        for _ in 0..256 {
            let code = generator.generate();
            assert!(is_well_formed(&code), "malformed code {code}");
        }
    }

    #[test]
    fn ten_thousand_codes_do_not_collide() {
        let generator = RandomCodeGenerator;
        let codes: HashSet<String> = (0..10_000).map(|_| generator.generate()).collect();
        assert_eq!(codes.len(), 10_000);
    }

    proptest! {
        #[test]
        fn rejects_ambiguous_characters(pos in 0usize..14, ch in prop::sample::select(vec!['0', 'O', '1', 'I', 'a'])) {
            let mut chars: Vec<char> = "ABCD-EFGH-JKLM".chars().collect();
            prop_assume!(chars[pos] != CODE_DELIMITER);
            chars[pos] = ch;
            let code: String = chars.into_iter().collect();
            prop_assert!(!is_well_formed(&code));
        }
    }
}
