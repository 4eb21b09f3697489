use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sentinel_vision::{
    corpus, EmbeddingScanner, ImageScanner, PhashScanner, StubImageEmbedder,
};
use std::sync::Arc;
use tempfile::TempDir;

fn banner(seed: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(320, 240, |x, y| {
        let v = ((x / 40 + y / 30 + u32::from(seed)) % 2) as u8 * 200;
        Rgb([v, v / 2, 255 - v])
    }))
}

#[tokio::test]
async fn registered_image_is_flagged_by_both_scanners() {
    let uploads = TempDir::new().unwrap();
    let corpus_dir = TempDir::new().unwrap();
    let upload = uploads.path().join("upload.png");
    banner(0)
        .save_with_format(&upload, ImageFormat::Png)
        .unwrap();

    let phash = PhashScanner::default();
    let embedding = EmbeddingScanner::new(Arc::new(StubImageEmbedder));
    let scanners: Vec<&dyn ImageScanner> = vec![&phash, &embedding];

    for scanner in &scanners {
        assert!(scanner.compare(&banner(0)).is_none(), "{}", scanner.name());
    }

    corpus::register_image(corpus_dir.path(), &upload)
        .await
        .unwrap();
    for scanner in &scanners {
        assert_eq!(scanner.reload(corpus_dir.path()).await.unwrap(), 1);
        let found = scanner
            .compare(&banner(0))
            .unwrap_or_else(|| panic!("{} should match", scanner.name()));
        assert!(found.record.starts_with("scam_"));
        let evidence = found.evidence.expect("evidence crop");
        let crop = image::load_from_memory(&evidence).unwrap();
        assert_eq!((crop.width(), crop.height()), (156, 156));
    }

    // Inverted checkerboard
    assert!(phash.compare(&banner(1)).is_none());
}
