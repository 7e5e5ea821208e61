//! Frequency to amateur band classification.

/// Inclusive band edges in kHz, paired with the band's wavelength in meters.
///
/// The ranges are disjoint and sorted by frequency.
pub const BAND_PLAN: &[(f64, f64, u16)] = &[
    (1800.0, 2000.0, 160),
    (3500.0, 4000.0, 80),
    (7000.0, 7300.0, 40),
    (10100.0, 10150.0, 30),
    (14000.0, 14350.0, 20),
    (18068.0, 18168.0, 17),
    (21000.0, 21450.0, 15),
    (24890.0, 24990.0, 12),
    (28000.0, 29700.0, 10),
    (50000.0, 54000.0, 6),
];

/// Returns the band (in meters) for a frequency in kHz.
///
/// Returns `None` when the frequency is outside every known band. Callers
/// treat that as a filter, not an error.
///
/// # Example
///
/// ```
/// use dxcluster_ingest::band::classify;
///
/// assert_eq!(classify(14074.0), Some(20));
/// assert_eq!(classify(29999.0), None);
/// ```
pub fn classify(frequency_khz: f64) -> Option<u16> {
    if !frequency_khz.is_finite() {
        return None;
    }
    BAND_PLAN
        .iter()
        .find(|(low, high, _)| (*low..=*high).contains(&frequency_khz))
        .map(|&(_, _, band)| band)
}

/// Human-readable label for a band, e.g. `"20m"`.
pub fn label(band: u16) -> String {
    format!("{}m", band)
}
