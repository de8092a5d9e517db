use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use slidescan::capture::convert::decode_jpeg;
use slidescan::capture::sdk::SdkSettings;
use slidescan::capture::simulated::{PatternProvider, SimulatedSdk};
use slidescan::capture::{DriverState, SdkCamera, UsbCamera};
use slidescan::gallery::{Gallery, Snapshotter};
use slidescan::stream::StreamEncoder;

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn jpeg_payload(chunk: &[u8]) -> &[u8] {
    let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    assert!(chunk.starts_with(header));
    assert!(chunk.ends_with(b"\r\n"));
    &chunk[header.len()..chunk.len() - 2]
}

#[test]
fn usb_source_to_decodable_chunk() {
    let poll = Duration::from_millis(20);
    let provider = Arc::new(PatternProvider::solid(640, 480, [255, 0, 0]));
    let camera = UsbCamera::new(provider, 0, poll);
    camera.start().unwrap();

    // The first read comes straight after open, well inside one poll interval.
    assert!(wait_for(poll + Duration::from_millis(100), || camera
        .slot()
        .has_frame()));

    let encoder = StreamEncoder::new("preview", camera.slot().clone(), 65, Duration::from_millis(100));
    let chunk = encoder.try_next_chunk().unwrap();
    let image = decode_jpeg(jpeg_payload(&chunk)).unwrap();
    assert_eq!(image.dimensions(), (640, 480));
    let [r, g, b] = image.get_pixel(320, 240).0;
    assert!(r > 230 && g < 30 && b < 30, "got {:?}", (r, g, b));

    camera.stop();
    assert!(camera.join(Duration::from_secs(2)));
    assert_eq!(camera.state(), DriverState::Stopped);
}

#[test]
fn sdk_camera_feeds_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let sdk = Arc::new(SimulatedSdk::new(Duration::from_millis(5)));
    let camera = SdkCamera::new(sdk, SdkSettings::default());
    camera.initialize().unwrap();
    camera.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || camera.slot().has_frame()));

    let gallery = Gallery::new();
    let snapshotter = Snapshotter::new(dir.path(), 95).with_source(camera.slot().clone());
    let entry = snapshotter.capture(&gallery).unwrap();
    assert_eq!(gallery.entries(), vec![entry]);

    let mut encoder = StreamEncoder::new("main", camera.slot().clone(), 70, Duration::from_millis(50));
    let chunk = encoder.next().unwrap();
    let image = decode_jpeg(jpeg_payload(&chunk)).unwrap();
    assert_eq!(image.dimensions(), (320, 240));

    camera.set_resolution(1).unwrap();
    assert!(wait_for(Duration::from_secs(2), || camera
        .slot()
        .read_copy()
        .is_some_and(|f| f.width() == 160)));

    let started = Instant::now();
    camera.stop();
    camera.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
}
