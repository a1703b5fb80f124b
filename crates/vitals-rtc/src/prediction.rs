//! Prediction records streamed back over the data channel.

use serde::{Deserialize, Serialize};

/// Merge a new, possibly partial record with the previous one: any field the
/// new record leaves empty keeps the prior value.
pub trait FillForward {
    fn fill_from(&mut self, prior: &Self);

    fn filled_from(mut self, prior: Option<&Self>) -> Self
    where
        Self: Sized,
    {
        if let Some(prior) = prior {
            self.fill_from(prior);
        }
        self
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, prior: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(prior);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalData {
    #[serde(rename = "hrList", default, skip_serializing_if = "Option::is_none")]
    pub hr_list: Option<Vec<Option<f64>>>,
    #[serde(rename = "fatigueList", default, skip_serializing_if = "Option::is_none")]
    pub fatigue_list: Option<Vec<Option<f64>>>,
    #[serde(rename = "darkCircleList", default, skip_serializing_if = "Option::is_none")]
    pub dark_circle_list: Option<Vec<Option<f64>>>,
    #[serde(rename = "pimpleCountList", default, skip_serializing_if = "Option::is_none")]
    pub pimple_count_list: Option<Vec<Option<f64>>>,
    #[serde(rename = "weightList", default, skip_serializing_if = "Option::is_none")]
    pub weight_list: Option<Vec<Option<f64>>>,
    #[serde(rename = "bodyFatList", default, skip_serializing_if = "Option::is_none")]
    pub body_fat_list: Option<Vec<Option<f64>>>,
}

impl FillForward for HistoricalData {
    fn fill_from(&mut self, prior: &Self) {
        fill(&mut self.hr_list, &prior.hr_list);
        fill(&mut self.fatigue_list, &prior.fatigue_list);
        fill(&mut self.dark_circle_list, &prior.dark_circle_list);
        fill(&mut self.pimple_count_list, &prior.pimple_count_list);
        fill(&mut self.weight_list, &prior.weight_list);
        fill(&mut self.body_fat_list, &prior.body_fat_list);
    }
}

/// One per-frame analysis result. `final` marks the end-of-session summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FramePrediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatigue: Option<f64>,
    #[serde(rename = "darkCircleLeft", default, skip_serializing_if = "Option::is_none")]
    pub dark_circle_left: Option<bool>,
    #[serde(rename = "darkCircleRight", default, skip_serializing_if = "Option::is_none")]
    pub dark_circle_right: Option<bool>,
    #[serde(rename = "pimpleCount", default, skip_serializing_if = "Option::is_none")]
    pub pimple_count: Option<f64>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_data: Option<HistoricalData>,
}

impl FillForward for FramePrediction {
    fn fill_from(&mut self, prior: &Self) {
        fill(&mut self.hr, &prior.hr);
        fill(&mut self.hrv, &prior.hrv);
        fill(&mut self.fatigue, &prior.fatigue);
        fill(&mut self.dark_circle_left, &prior.dark_circle_left);
        fill(&mut self.dark_circle_right, &prior.dark_circle_right);
        fill(&mut self.pimple_count, &prior.pimple_count);
        fill(&mut self.person_id, &prior.person_id);
        fill(&mut self.participant_id, &prior.participant_id);
        if let Some(previous) = &prior.historical_data {
            self.historical_data
                .get_or_insert_with(HistoricalData::default)
                .fill_from(previous);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyPrediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "bodyFat", default, skip_serializing_if = "Option::is_none")]
    pub body_fat: Option<f64>,
}

impl FillForward for BodyPrediction {
    fn fill_from(&mut self, prior: &Self) {
        fill(&mut self.weight, &prior.weight);
        fill(&mut self.body_fat, &prior.body_fat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> FramePrediction {
        FramePrediction {
            hr: Some(72.0),
            hrv: Some(41.5),
            fatigue: Some(0.2),
            dark_circle_left: Some(true),
            dark_circle_right: Some(false),
            pimple_count: Some(3.0),
            is_final: false,
            person_id: Some("person-7".into()),
            participant_id: Some("P-001".into()),
            historical_data: Some(HistoricalData {
                hr_list: Some(vec![Some(70.0), None, Some(72.0)]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn empty_record_over_prior_equals_prior() {
        let prior = full();
        let merged = FramePrediction::default().filled_from(Some(&prior));
        assert_eq!(merged, prior);
    }

    #[test]
    fn present_fields_win_over_prior() {
        let prior = full();
        let update = FramePrediction {
            hr: Some(80.0),
            ..Default::default()
        };
        let merged = update.filled_from(Some(&prior));
        assert_eq!(merged.hr, Some(80.0));
        assert_eq!(merged.hrv, prior.hrv);
        assert_eq!(merged.participant_id, prior.participant_id);
    }

    #[test]
    fn historical_lists_merge_field_by_field() {
        let prior = full();
        let update = FramePrediction {
            historical_data: Some(HistoricalData {
                fatigue_list: Some(vec![Some(0.3)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = update.filled_from(Some(&prior));
        let history = merged.historical_data.unwrap();
        assert_eq!(history.fatigue_list, Some(vec![Some(0.3)]));
        assert_eq!(history.hr_list, Some(vec![Some(70.0), None, Some(72.0)]));
    }

    #[test]
    fn decodes_wire_keys() {
        let record: FramePrediction = serde_json::from_str(
            r#"{"hr": 64, "darkCircleLeft": true, "pimpleCount": 2, "final": true,
                "participant_id": "P-9", "historical_data": {"hrList": [60, null, 64]}}"#,
        )
        .unwrap();
        assert!(record.is_final);
        assert_eq!(record.hr, Some(64.0));
        assert_eq!(record.dark_circle_left, Some(true));
        assert_eq!(record.dark_circle_right, None);
        assert_eq!(record.participant_id.as_deref(), Some("P-9"));
        assert_eq!(
            record.historical_data.unwrap().hr_list,
            Some(vec![Some(60.0), None, Some(64.0)])
        );
    }

    #[test]
    fn dark_circle_flags_are_booleans() {
        let record: FramePrediction = serde_json::from_str(
            r#"{"hr":70.0,"darkCircleLeft":true,"darkCircleRight":false,"final":false}"#,
        )
        .unwrap();
        assert_eq!(record.dark_circle_left, Some(true));
        assert_eq!(record.dark_circle_right, Some(false));

        let merged = FramePrediction::default().filled_from(Some(&record));
        assert_eq!(merged.dark_circle_right, Some(false));
    }

    #[test]
    fn body_prediction_fills_forward() {
        let prior = BodyPrediction {
            weight: Some(70.2),
            body_fat: Some(18.0),
        };
        let merged = BodyPrediction {
            weight: Some(70.5),
            body_fat: None,
        }
        .filled_from(Some(&prior));
        assert_eq!(merged.weight, Some(70.5));
        assert_eq!(merged.body_fat, Some(18.0));
    }
}
