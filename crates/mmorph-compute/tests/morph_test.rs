//! Morphology dispatch tests for mmorph-compute.
//!
//! Every test runs on the host device so the dispatch log can be inspected.

use mmorph_compute::device::AsAny;
use mmorph_compute::{
    ComputeError, DeviceClass, DeviceSession, DispatchRecord, HostDevice, KernelName, NdRange,
    SessionConfig,
};
use mmorph_core::{Image2d, Window};

fn session_on(device: HostDevice) -> DeviceSession {
    DeviceSession::with_device(Box::new(device), SessionConfig::default()).unwrap()
}

fn dispatches(session: &DeviceSession) -> Vec<DispatchRecord> {
    session
        .device()
        .as_any()
        .downcast_ref::<HostDevice>()
        .expect("host device")
        .dispatch_log()
}

fn result(session: &mut DeviceSession) -> Image2d<i32> {
    let id = session.current_image().expect("current image");
    session.fetch(None).unwrap().wait().unwrap();
    session.save(id).unwrap()
}

/// Single foreground pixel in the middle of a 7x7 background.
fn dot() -> Image2d<i32> {
    let mut img = Image2d::new(7, 7);
    img.set(3, 3, 1);
    img
}

#[test]
fn test_binarize_then_erode_scenario() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::origin()).unwrap();
    assert_eq!(session.se(se).unwrap().count, 1);
    assert_eq!(session.se(se).unwrap().rowrad, 0);

    session.open(&Image2d::filled(3, 3, 1)).unwrap();
    session.push_binarize(1, 0, 255).unwrap();
    assert_eq!(result(&mut session).data(), &[255; 9]);

    session.push_naive_erosion(se).unwrap();
    assert_eq!(result(&mut session).data(), &[255; 9]);
}

#[test]
fn test_origin_opening_is_identity() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::origin()).unwrap();
    let img = Image2d::from_fn(9, 13, |r, c| ((r * 5 + c * 3) % 4 == 0) as i32);

    session.open(&img).unwrap();
    session.push_naive_opening(se).unwrap();
    assert_eq!(result(&mut session).data(), img.data());

    session.push_naive_closing(se).unwrap();
    assert_eq!(result(&mut session).data(), img.data());
}

#[test]
fn test_opening_dispatch_order() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::c8()).unwrap();
    let id = session.open(&dot()).unwrap();
    let pair = session.image(id).unwrap().buffers().clone();

    session.push_naive_opening(se).unwrap();

    let log = dispatches(&session);
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|d| d.kernel == KernelName::NaiveMorph));
    // Each pass reads what the previous one wrote.
    assert_eq!((log[0].input, log[0].output), (pair.first().id(), pair.second().id()));
    assert_eq!((log[1].input, log[1].output), (pair.second().id(), pair.first().id()));
    // c8 has 9 points: erosion needs all of them, dilation any one.
    assert_eq!(log[0].target, Some(9));
    assert_eq!(log[1].target, Some(-8));

    let image = session.image(id).unwrap();
    assert_eq!(image.dispatch_count(), 2);
    assert!(!image.is_swapped());

    // Erosion first removes the isolated dot for good.
    assert!(result(&mut session).data().iter().all(|&v| v == 0));
}

#[test]
fn test_closing_dispatch_order() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::c8()).unwrap();
    let id = session.open(&dot()).unwrap();
    let pair = session.image(id).unwrap().buffers().clone();

    session.push_naive_closing(se).unwrap();

    let log = dispatches(&session);
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|d| d.kernel == KernelName::NaiveMorph));
    assert_eq!((log[0].input, log[0].output), (pair.first().id(), pair.second().id()));
    assert_eq!((log[1].input, log[1].output), (pair.second().id(), pair.first().id()));
    assert_eq!(log[0].target, Some(-8));
    assert_eq!(log[1].target, Some(9));

    let image = session.image(id).unwrap();
    assert_eq!(image.dispatch_count(), 2);
    assert!(!image.is_swapped());

    // Dilation first grows the dot to 3x3, erosion shrinks it back.
    assert_eq!(result(&mut session).data(), dot().data());
}

#[test]
fn test_each_push_toggles_roles_once() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::c4()).unwrap();
    let id = session.open(&Image2d::filled(8, 8, 1)).unwrap();

    let mut swapped = false;
    for step in 0..5 {
        if step % 2 == 0 {
            session.push_binarize(1, 0, 1).unwrap();
        } else {
            session.push_naive_dilation(se).unwrap();
        }
        swapped = !swapped;
        let image = session.image(id).unwrap();
        assert_eq!(image.is_swapped(), swapped);
        assert_eq!(image.dispatch_count(), step + 1);
    }
}

#[test]
fn test_dilation_grows_by_radius() {
    let mut session = session_on(HostDevice::new());
    let se = session.load_se(&Window::rect(3, 5).unwrap()).unwrap();
    session.open(&dot()).unwrap();
    session.push_naive_dilation(se).unwrap();

    let out = result(&mut session);
    for r in 0..7 {
        for c in 0..7 {
            let inside = (2..=4).contains(&r) && (1..=5).contains(&c);
            assert_eq!(out.get(r, c), inside as i32, "pixel ({r}, {c})");
        }
    }
}

#[test]
fn test_unbitmap_precondition_cpu() {
    let mut session = session_on(HostDevice::new());

    let id = session.open(&Image2d::filled(64, 64, 0)).unwrap();
    session.push_unbitmap().unwrap();
    let log = dispatches(&session);
    assert_eq!(log[0].kernel, KernelName::Unbitmap);
    assert_eq!(log[0].global, NdRange::D1(128));
    assert_eq!(log[0].local, NdRange::D1(1));
    session.close(id);

    let id = session.open(&Image2d::filled(10, 10, 0)).unwrap();
    let err = session.push_unbitmap().unwrap_err();
    assert!(matches!(err, ComputeError::Precondition { op: "unbitmap", .. }));
    assert_eq!(dispatches(&session).len(), 1);
    assert_eq!(session.image(id).unwrap().dispatch_count(), 0);
}

#[test]
fn test_parallel_packed_divisibility() {
    let mut session = session_on(HostDevice::emulating(DeviceClass::Gpu));
    assert!(!session.is_cpu());

    // 64x64 = 4096 pixels, a multiple of 32 x 64
    session.open(&Image2d::filled(64, 64, 0)).unwrap();
    session.push_bitmapped_binarize(1, false).unwrap();
    session.push_unbitmap().unwrap();
    let log = dispatches(&session);
    assert_eq!(log[1].global, NdRange::D1(128));
    assert_eq!(log[1].local, NdRange::D1(64));

    // 32x32 = 1024 pixels is fine on a CPU but not with 64 lanes
    session.open(&Image2d::filled(32, 32, 0)).unwrap();
    assert!(matches!(
        session.push_bitmapped_binarize(1, false),
        Err(ComputeError::Precondition { .. })
    ));
}

#[test]
fn test_parallel_grid_uses_device_preference() {
    let mut session = session_on(HostDevice::emulating(DeviceClass::Gpu));
    session.open(&Image2d::filled(24, 40, 3)).unwrap();
    session.push_binarize(2, 0, 1).unwrap();
    assert_eq!(dispatches(&session)[0].local, NdRange::D2(8, 8));
    assert_eq!(dispatches(&session)[0].global, NdRange::D2(40, 24));
}

#[test]
fn test_packed_round_trip() {
    let mut session = session_on(HostDevice::new());
    let img = Image2d::from_fn(8, 64, |r, c| ((r * 64 + c) * 37 % 256) as i32);
    session.open(&img).unwrap();
    session.push_bitmapped_binarize(128, false).unwrap();
    session.push_unbitmap().unwrap();

    let out = result(&mut session);
    let expected: Vec<i32> = img.data().iter().map(|&v| (v >= 128) as i32).collect();
    assert_eq!(out.data(), expected.as_slice());
}

#[test]
fn test_packed_inverted() {
    let mut session = session_on(HostDevice::new());
    let img = Image2d::from_fn(1, 64, |_, c| c as i32);
    session.open(&img).unwrap();
    session.push_bitmapped_binarize(10, true).unwrap();
    session.push_unbitmap().unwrap();

    let out = result(&mut session);
    let expected: Vec<i32> = (0..64).map(|c| (c < 10) as i32).collect();
    assert_eq!(out.data(), expected.as_slice());
}

#[test]
fn test_packed_dilation_and_opening() {
    let mut session = session_on(HostDevice::new());
    let mut img = Image2d::new(6, 64);
    img.set(2, 31, 1);
    session.open(&img).unwrap();

    session.push_bitmapped_binarize(1, false).unwrap();
    session.push_bitmapped_dilation(1, 1).unwrap();
    session.push_unbitmap().unwrap();
    let out = result(&mut session);
    for r in 0..6 {
        for c in 0..64 {
            // The 3x3 block straddles the word boundary at column 32.
            let inside = (1..=3).contains(&r) && (30..=32).contains(&c);
            assert_eq!(out.get(r, c), inside as i32, "pixel ({r}, {c})");
        }
    }

    let before = dispatches(&session).len();
    session.open(&img).unwrap();
    session.push_bitmapped_binarize(1, false).unwrap();
    session.push_bitmapped_opening(1, 1).unwrap();
    let passes: Vec<KernelName> = dispatches(&session)[before + 1..].iter().map(|d| d.kernel).collect();
    assert_eq!(
        passes,
        vec![
            KernelName::BitmappedErosionH,
            KernelName::BitmappedErosionV,
            KernelName::BitmappedDilationH,
            KernelName::BitmappedDilationV,
        ]
    );
    assert_eq!(dispatches(&session)[before + 1].global, NdRange::D2(2, 6));

    session.push_unbitmap().unwrap();
    assert!(result(&mut session).data().iter().all(|&v| v == 0));
}

#[test]
fn test_packed_morph_needs_whole_words() {
    let mut session = session_on(HostDevice::new());
    session.open(&Image2d::filled(4, 48, 1)).unwrap();
    let err = session.push_bitmapped_erosion_h(1).unwrap_err();
    assert!(matches!(err, ComputeError::Precondition { .. }));
    assert!(dispatches(&session).is_empty());
}
