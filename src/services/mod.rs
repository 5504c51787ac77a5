/// 考试服务 (Exam Services)
///
/// 每个服务只提供一套 `ExamRules`: 模型数量、标志数量、步骤表与逐槽位判定.
/// 区域坐标为编译期默认值, 可由配置文件 `[regions]` 表覆盖.
/// - welding: 焊接作业 (8 个模型)
/// - basket:  吊篮作业 (3 个模型)
/// - sling:   吊索具作业 (4 个模型)
/// - wearing: 焊接劳保穿戴检查 (2 个模型)
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::processor::ExamRules;
use crate::{Error, Result};

pub mod basket;
pub mod sling;
pub mod wearing;
pub mod welding;

pub use basket::{BasketRegions, BasketRules};
pub use sling::{SlingRegions, SlingRules};
pub use wearing::{WearingRegions, WearingRules};
pub use welding::{WeldingRegions, WeldingRules};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Welding,
    Basket,
    Sling,
    Wearing,
}

impl ServiceKind {
    pub fn model_count(self) -> usize {
        match self {
            ServiceKind::Welding => welding::MODEL_COUNT,
            ServiceKind::Basket => basket::MODEL_COUNT,
            ServiceKind::Sling => sling::MODEL_COUNT,
            ServiceKind::Wearing => wearing::MODEL_COUNT,
        }
    }

    /// 按服务类型构造规则, `regions` 为配置中的区域覆盖
    pub fn build_rules(self, regions: Option<&toml::Table>) -> Result<Box<dyn ExamRules>> {
        Ok(match self {
            ServiceKind::Welding => Box::new(WeldingRules::new(load_regions(regions)?)),
            ServiceKind::Basket => Box::new(BasketRules::new(load_regions(regions)?)),
            ServiceKind::Sling => Box::new(SlingRules::new(load_regions(regions)?)),
            ServiceKind::Wearing => Box::new(WearingRules::new(load_regions(regions)?)),
        })
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceKind::Welding => "welding",
            ServiceKind::Basket => "basket",
            ServiceKind::Sling => "sling",
            ServiceKind::Wearing => "wearing",
        })
    }
}

/// 缺省字段回落到编译期常量
fn load_regions<T: DeserializeOwned + Default>(table: Option<&toml::Table>) -> Result<T> {
    match table {
        None => Ok(T::default()),
        Some(t) => toml::Value::Table(t.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("invalid [regions]: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_kind_model_counts() {
        assert_eq!(ServiceKind::Welding.model_count(), 8);
        assert_eq!(ServiceKind::Basket.model_count(), 3);
        assert_eq!(ServiceKind::Sling.model_count(), 4);
        assert_eq!(ServiceKind::Wearing.model_count(), 2);
        assert_eq!(ServiceKind::Sling.to_string(), "sling");
    }

    #[test]
    fn rules_match_service_kind() {
        for kind in [
            ServiceKind::Welding,
            ServiceKind::Basket,
            ServiceKind::Sling,
            ServiceKind::Wearing,
        ] {
            let rules = kind.build_rules(None).unwrap();
            assert_eq!(rules.name(), kind.to_string());
            assert_eq!(rules.model_count(), kind.model_count());
        }
    }

    #[test]
    fn partial_region_override() {
        let table: toml::Table = toml::from_str("safe_area = [[0, 0], [10, 0], [10, 10]]").unwrap();
        let regions: WeldingRegions = load_regions(Some(&table)).unwrap();
        assert_eq!(regions.safe_area.points().len(), 3);
        assert_eq!(regions.welding_machine, WeldingRegions::default().welding_machine);

        let bad: toml::Table = toml::from_str("safe_area = \"left\"").unwrap();
        assert!(matches!(
            load_regions::<WeldingRegions>(Some(&bad)),
            Err(Error::Config(_))
        ));
    }
}
