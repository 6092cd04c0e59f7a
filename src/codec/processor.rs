use super::{output_filename, CodecService};
use crate::models::OutputFormat;
use crate::retention::delete_quietly;
use crate::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};

pub struct ImageCodec {
    output_dir: PathBuf,
}

impl ImageCodec {
    pub fn new(output_dir: &Path) -> Result<Self> {
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    fn encode_sync(source: PathBuf, output: PathBuf, format: OutputFormat) -> Result<()> {
        // Content sniffing: the stored extension comes from the client.
        let image = ImageReader::open(&source)?.with_guessed_format()?.decode()?;

        let image = match format {
            // JPEG has no alpha channel
            OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
            // The WebP encoder only accepts 8-bit channels
            OutputFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8()),
            OutputFormat::Png => image,
        };

        image.save_with_format(&output, format.image_format())?;
        Ok(())
    }
}

#[async_trait]
impl CodecService for ImageCodec {
    async fn encode(&self, source: &Path, format: OutputFormat) -> Result<PathBuf> {
        let filename = output_filename(source, format)?;
        let output_path = self.output_dir.join(&filename);

        let result = tokio::task::spawn_blocking({
            let source = source.to_path_buf();
            let output_path = output_path.clone();
            move || Self::encode_sync(source, output_path, format)
        })
        .await
        .map_err(|e| Error::Invariant(format!("Codec task join error: {}", e)))?;

        if let Err(e) = result {
            delete_quietly(&output_path);
            return Err(e);
        }

        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;
    use tempfile::TempDir;

    fn write_test_image(dir: &Path, name: &str) -> PathBuf {
        let img = image::RgbaImage::from_pixel(12, 8, image::Rgba([255, 0, 0, 128]));
        let path = dir.join(name);
        img.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    fn detect_format(path: &Path) -> Option<ImageFormat> {
        ImageReader::open(path)
            .unwrap()
            .with_guessed_format()
            .unwrap()
            .format()
    }

    struct TestCodec {
        codec: ImageCodec,
        input_dir: TempDir,
        _output_dir: TempDir,
    }

    impl TestCodec {
        fn new() -> Result<Self> {
            let input_dir = TempDir::new()?;
            let output_dir = TempDir::new()?;
            let codec = ImageCodec::new(output_dir.path())?;

            Ok(Self {
                codec,
                input_dir,
                _output_dir: output_dir,
            })
        }
    }

    #[tokio::test]
    async fn test_converts_to_every_format() {
        let test_codec = TestCodec::new().unwrap();

        for format in OutputFormat::ALL {
            let source = write_test_image(test_codec.input_dir.path(), "100-1.png");
            let output = test_codec.codec.encode(&source, format).await.unwrap();

            assert!(output.exists());
            assert!(output
                .to_string_lossy()
                .ends_with(&format!("100-1.{}", format.extension())));
            assert_eq!(detect_format(&output), Some(format.image_format()));

            let decoded = image::open(&output).unwrap();
            assert_eq!(decoded.width(), 12);
            assert_eq!(decoded.height(), 8);
        }
    }

    #[tokio::test]
    async fn test_ignores_misleading_extension() {
        let test_codec = TestCodec::new().unwrap();
        // PNG bytes stored under a .jpg name
        let source = write_test_image(test_codec.input_dir.path(), "200-2.jpg");

        let output = test_codec
            .codec
            .encode(&source, OutputFormat::Jpeg)
            .await
            .unwrap();
        assert_eq!(detect_format(&output), Some(ImageFormat::Jpeg));
    }

    #[tokio::test]
    async fn test_corrupt_input_fails_without_leaving_output() {
        let test_codec = TestCodec::new().unwrap();
        let source = test_codec.input_dir.path().join("300-3.png");
        std::fs::write(&source, b"definitely not a png").unwrap();

        let result = test_codec.codec.encode(&source, OutputFormat::Webp).await;
        assert!(result.is_err());
        assert!(!test_codec._output_dir.path().join("300-3.webp").exists());
    }

    #[tokio::test]
    async fn test_missing_input_fails() {
        let test_codec = TestCodec::new().unwrap();
        let source = test_codec.input_dir.path().join("400-4.png");

        let err = test_codec
            .codec
            .encode(&source, OutputFormat::Png)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
