use bitfield::bitfield;

bitfield! {
    /// FAT packed date and time.
    ///
    /// Bits 0..4 hold seconds/2, 5..10 the minute, 11..15 the hour,
    /// 16..20 the day, 21..24 the month and 25..31 the year counted
    /// from 1980. The zero value means "no timestamp recorded".
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct Timestamp(u32);
    impl Debug;
    pub u8, seconds2, set_seconds2: 4, 0;
    pub u8, minute, set_minute: 10, 5;
    pub u8, hour, set_hour: 15, 11;
    pub u8, day, set_day: 20, 16;
    pub u8, month, set_month: 24, 21;
    pub u8, year_since_1980, set_year_since_1980: 31, 25;
}

impl Timestamp {
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let mut stamp = Self(0);
        stamp.set_year_since_1980(year.saturating_sub(1980) as u8);
        stamp.set_month(month);
        stamp.set_day(day);
        stamp.set_hour(hour);
        stamp.set_minute(minute);
        stamp.set_seconds2(second / 2);
        stamp
    }

    pub fn year(&self) -> u16 {
        1980 + self.year_since_1980() as u16
    }

    pub fn second(&self) -> u8 {
        self.seconds2() * 2
    }

    /// The date word as stored in a directory entry.
    pub(crate) fn date(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The time word as stored in a directory entry.
    pub(crate) fn time(&self) -> u16 {
        self.0 as u16
    }

    pub(crate) fn from_words(date: u16, time: u16) -> Self {
        Self((date as u32) << 16 | time as u32)
    }

    pub(crate) fn raw(&self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

/// Supplies the current time for created/modified stamps. A volume
/// mounted without a clock writes zero timestamps.
pub type ClockFn = fn() -> Timestamp;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packing() {
        let stamp = Timestamp::new(2024, 11, 30, 23, 59, 58);
        assert_eq!(stamp.year(), 2024);
        assert_eq!(stamp.month(), 11);
        assert_eq!(stamp.day(), 30);
        assert_eq!(stamp.hour(), 23);
        assert_eq!(stamp.minute(), 59);
        assert_eq!(stamp.second(), 58);
        assert_eq!(Timestamp::from_words(stamp.date(), stamp.time()), stamp);
    }

    #[test]
    fn epoch_is_zero() {
        assert_eq!(Timestamp::default().raw(), 0);
        assert_eq!(Timestamp::new(1980, 0, 0, 0, 0, 0).raw(), 0);
    }
}
