#[derive(Debug, Clone, Default)]
pub struct Rng8 {
    x: u8,
    a: u8,
    b: u8,
    c: u8,
}

impl Rng8 {
    pub fn new(seed: u8) -> Self {
        let mut rng = Self::default();
        rng.reseed(seed, seed.rotate_left(3), !seed);
        rng
    }

    pub fn reseed(&mut self, s1: u8, s2: u8, s3: u8) {
        self.a ^= s1;
        self.b ^= s2;
        self.c ^= s3;
        self.next_u8();
    }

    pub fn next_u8(&mut self) -> u8 {
        self.x = self.x.wrapping_add(1);
        self.a ^= self.c ^ self.x;
        self.b = self.b.wrapping_add(self.a);
        self.c = self.c.wrapping_add(self.b >> 1) ^ self.a;
        self.c
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_u8() & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Rng8::new(42);
        let mut b = Rng8::new(42);
        for _ in 0..64 {
            assert_eq!(a.next_u8(), b.next_u8());
        }
    }

    #[test]
    fn reseed_changes_sequence() {
        let mut a = Rng8::new(1);
        let mut b = Rng8::new(1);
        b.reseed(7, 9, 11);
        let sa: Vec<u8> = (0..16).map(|_| a.next_u8()).collect();
        let sb: Vec<u8> = (0..16).map(|_| b.next_u8()).collect();
        assert_ne!(sa, sb);
    }

    #[test]
    fn low_bits_cover_all_slots() {
        let mut rng = Rng8::new(3);
        let mut seen = [false; 8];
        for _ in 0..256 {
            seen[(rng.next_u8() & 7) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
