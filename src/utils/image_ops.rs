use image::ImageFormat;

/// Format of an encoded image, sniffed from its magic bytes.
///
/// Only the formats the translation service accepts and returns are
/// recognised; anything else is treated as not-an-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFormat(ImageFormat);

impl EncodedFormat {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP) => {
                Some(Self(format))
            }
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.0 {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::WebP => "webp",
            _ => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.0 {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::WebP => "image/webp",
            _ => "image/png",
        }
    }
}

/// MIME type for an upload, falling back to octet-stream for unknown data
pub fn mime_type_for(bytes: &[u8]) -> &'static str {
    EncodedFormat::sniff(bytes)
        .map(|f| f.mime_type())
        .unwrap_or("application/octet-stream")
}
