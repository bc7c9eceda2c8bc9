//! Image serialization
//!
//! Writes the linear RGB raster as a binary PPM ("P6") file. The file is
//! only created once a complete raster is in hand; there are no partial
//! outputs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::formats::RgbRaster;

/// Write a raster as a binary PPM file
///
/// Emits the ASCII header `P6\n<w> <h>\n255\n` followed by
/// `width * height * 3` bytes of R,G,B data.
pub fn write_ppm(path: &Path, raster: &RgbRaster) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    write!(out, "P6\n{} {}\n255\n", raster.width, raster.height)?;
    out.write_all(&raster.data)?;
    out.flush()?;

    info!(
        "Screenshot saved to {} ({}x{})",
        path.display(),
        raster.width,
        raster.height
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppm_header_and_payload() {
        let mut raster = RgbRaster::new(8, 8);
        raster.data[0] = 0x12;
        let path = std::env::temp_dir().join("kmsnap-ppm-test.ppm");
        write_ppm(&path, &raster).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n8 8\n255\n"));
        assert_eq!(bytes.len(), b"P6\n8 8\n255\n".len() + 8 * 8 * 3);
        assert_eq!(bytes[b"P6\n8 8\n255\n".len()], 0x12);
        std::fs::remove_file(&path).ok();
    }
}
