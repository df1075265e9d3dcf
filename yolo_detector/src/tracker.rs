use crate::detection::{BoundingBox, Detection};

const DEFAULT_MATCH_IOU: f32 = 0.3;
const DEFAULT_MAX_AGE: u64 = 30;

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    class_id: u32,
    bbox: BoundingBox,
    last_seen: u64,
}

/// Keeps track IDs stable across the sampled frames of a single request.
///
/// One instance per request; sharing it between requests would leak IDs
/// across unrelated videos.
#[derive(Debug)]
pub struct TrackState {
    tracks: Vec<Track>,
    next_id: u64,
    frame: u64,
    match_iou: f32,
    max_age: u64,
}

impl Default for TrackState {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_IOU, DEFAULT_MAX_AGE)
    }
}

impl TrackState {
    pub fn new(match_iou: f32, max_age: u64) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            frame: 0,
            match_iou,
            max_age,
        }
    }

    /// Assigns a `track_id` to every detection of one frame.
    pub fn update(&mut self, detections: &mut [Detection]) {
        self.frame += 1;
        let frame = self.frame;
        let max_age = self.max_age;
        self.tracks.retain(|t| frame - t.last_seen <= max_age);

        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .total_cmp(&detections[a].confidence)
        });

        let mut claimed = vec![false; self.tracks.len()];
        for index in order {
            let detection = &mut detections[index];
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, t)| !claimed[*i] && t.class_id == detection.class_id)
                .map(|(i, t)| (i, t.bbox.iou(&detection.bbox)))
                .filter(|(_, iou)| *iou >= self.match_iou)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((i, _)) => {
                    claimed[i] = true;
                    let track = &mut self.tracks[i];
                    track.bbox = detection.bbox;
                    track.last_seen = frame;
                    detection.track_id = Some(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        class_id: detection.class_id,
                        bbox: detection.bbox,
                        last_seen: frame,
                    });
                    claimed.push(true);
                    detection.track_id = Some(id);
                }
            }
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class_id: u32, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            class_id,
            class_name: format!("class{}", class_id),
            confidence,
            bbox,
            track_id: None,
        }
    }

    #[test]
    fn test_track_id_stable_across_frames() {
        let mut tracks = TrackState::default();

        let mut first = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        tracks.update(&mut first);
        let mut second = vec![detection(0, 0.8, BoundingBox::new(1., 1., 11., 11.))];
        tracks.update(&mut second);

        assert_eq!(first[0].track_id, Some(1));
        assert_eq!(second[0].track_id, Some(1));
    }

    #[test]
    fn test_new_id_for_distant_box_or_other_class() {
        let mut tracks = TrackState::default();

        let mut first = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        tracks.update(&mut first);
        let mut second = vec![
            detection(1, 0.9, BoundingBox::new(0., 0., 10., 10.)),
            detection(0, 0.7, BoundingBox::new(100., 100., 110., 110.)),
        ];
        tracks.update(&mut second);

        assert_eq!(second[0].track_id, Some(2));
        assert_eq!(second[1].track_id, Some(3));
    }

    #[test]
    fn test_two_detections_never_share_a_track() {
        let mut tracks = TrackState::default();

        let mut first = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        tracks.update(&mut first);
        let mut second = vec![
            detection(0, 0.6, BoundingBox::new(0., 0., 10., 10.)),
            detection(0, 0.8, BoundingBox::new(1., 0., 11., 10.)),
        ];
        tracks.update(&mut second);

        assert_eq!(second[1].track_id, Some(1));
        assert_eq!(second[0].track_id, Some(2));
    }

    #[test]
    fn test_stale_tracks_expire() {
        let mut tracks = TrackState::new(0.3, 1);

        let mut first = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        tracks.update(&mut first);
        tracks.update(&mut []);
        tracks.update(&mut []);
        let mut again = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        tracks.update(&mut again);

        assert_eq!(again[0].track_id, Some(2));
    }

    #[test]
    fn test_states_are_independent() {
        let mut a = TrackState::default();
        let mut b = TrackState::default();

        let mut da = vec![detection(0, 0.9, BoundingBox::new(0., 0., 10., 10.))];
        let mut db = vec![detection(0, 0.9, BoundingBox::new(50., 50., 60., 60.))];
        a.update(&mut da);
        b.update(&mut db);

        assert_eq!(da[0].track_id, Some(1));
        assert_eq!(db[0].track_id, Some(1));
    }
}
