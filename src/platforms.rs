//! Static platform knowledge.
//!
//! Conversion policy and remote-service taxonomy are core domain data and
//! change when platforms are added, so they live in explicit tables here
//! rather than scattered conditionals.

/// Platforms whose payloads are disc images and get converted to CHD.
pub const DISC_IMAGE_PLATFORMS: &[&str] = &[
    "SEGACD", "DC", "PANASONIC", "PS", "NAOMI", "PCFX", "PCECD", "SATURN",
];

/// Whether a platform's payload should be converted to a compressed
/// disc image.
pub fn needs_disc_image(platform_id: &str) -> bool {
    DISC_IMAGE_PLATFORMS.contains(&platform_id)
}

/// ScreenScraper numeric system ID for a platform identifier.
///
/// Returns `None` for platforms the remote service has no mapping for;
/// the scraper then skips straight to the cache fallback.
pub fn system_id(platform_id: &str) -> Option<&'static str> {
    let id = match platform_id {
        "ADVMAME" | "ARCADE" => "75", // Mame
        "AMIGA" => "64",              // Commodore Amiga
        "AMIGACD" => "134",           // Commodore Amiga CD
        "DC" => "23",                 // Dreamcast
        "FC" => "3",                  // NES (Famicom)
        "GB" => "9",                  // Game Boy
        "GBA" => "12",                // Game Boy Advance
        "GBC" => "10",                // Game Boy Color
        "MD" => "1",                  // Sega Genesis
        "N64" => "14",                // Nintendo 64
        "NAOMI" => "56",              // Sega Naomi
        "NDS" => "15",                // Nintendo DS
        "PANASONIC" => "29",          // 3DO
        "PCECD" => "114",             // PC Engine CD
        "PCFX" => "72",               // PC-FX
        "PS" => "57",                 // PlayStation
        "PSP" => "61",                // PlayStation Portable
        "SATURN" => "22",             // Sega Saturn
        "SEGACD" => "20",             // Mega-CD
        "SFC" => "4",                 // Super Nintendo
        _ => return None,
    };
    Some(id)
}
